// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound transports to the downstream consumer.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::DownstreamProtocol;
use crate::constants::SEND_TIMEOUT;
use crate::errors::ForwardError;

#[async_trait]
pub trait Downstream: Send {
    /// Configured `host:port` of the consumer.
    fn address(&self) -> &str;

    /// Delivers one encoded record. On error the transport resets itself so
    /// the next call reconnects.
    async fn send(&mut self, record: &[u8]) -> Result<(), ForwardError>;

    /// Flushes and releases the connection, if any.
    async fn close(&mut self) {}
}

/// Builds the transport selected in the configuration.
pub fn connect_lazily(protocol: DownstreamProtocol, address: &str) -> Box<dyn Downstream> {
    match protocol {
        DownstreamProtocol::Tcp => Box::new(TcpDownstream::new(address)),
        DownstreamProtocol::Udp => Box::new(UdpDownstream::new(address)),
    }
}

/// Newline-delimited records over TCP, reconnecting after any failure.
#[derive(Debug)]
pub struct TcpDownstream {
    address: String,
    stream: Option<TcpStream>,
}

impl TcpDownstream {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&self) -> Result<TcpStream, ForwardError> {
        let stream = timeout(SEND_TIMEOUT, TcpStream::connect(self.address.as_str()))
            .await
            .map_err(|_| ForwardError::Timeout(self.address.clone()))?
            .map_err(|source| ForwardError::Connect {
                address: self.address.clone(),
                source,
            })?;
        // Records are small and latency matters more than packing.
        let _ = stream.set_nodelay(true);
        info!("Connected to downstream {}", self.address);
        Ok(stream)
    }
}

#[async_trait]
impl Downstream for TcpDownstream {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&mut self, record: &[u8]) -> Result<(), ForwardError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        match timeout(SEND_TIMEOUT, stream.write_all(record)).await {
            Ok(Ok(())) => {
                self.stream = Some(stream);
                Ok(())
            }
            Ok(Err(source)) => Err(ForwardError::Send {
                address: self.address.clone(),
                source,
            }),
            Err(_) => Err(ForwardError::Timeout(self.address.clone())),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error closing downstream connection: {}", e);
            }
        }
    }
}

/// One record per datagram. Delivery is fire-and-forget; only local send
/// errors (including ICMP refusals on the connected socket) are reported.
#[derive(Debug)]
pub struct UdpDownstream {
    address: String,
    socket: Option<UdpSocket>,
}

impl UdpDownstream {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            socket: None,
        }
    }

    async fn connect(&self) -> Result<UdpSocket, ForwardError> {
        let connect_error = |source| ForwardError::Connect {
            address: self.address.clone(),
            source,
        };
        let target = timeout(SEND_TIMEOUT, tokio::net::lookup_host(self.address.as_str()))
            .await
            .map_err(|_| ForwardError::Timeout(self.address.clone()))?
            .map_err(connect_error)?
            .next()
            .ok_or_else(|| {
                connect_error(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "address resolved to nothing",
                ))
            })?;
        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await.map_err(connect_error)?;
        socket.connect(target).await.map_err(connect_error)?;
        debug!("Sending downstream datagrams to {}", target);
        Ok(socket)
    }
}

#[async_trait]
impl Downstream for UdpDownstream {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&mut self, record: &[u8]) -> Result<(), ForwardError> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => self.connect().await?,
        };
        match socket.send(record).await {
            Ok(_) => {
                self.socket = Some(socket);
                Ok(())
            }
            Err(source) => Err(ForwardError::Send {
                address: self.address.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_downstream_delivers_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let mut downstream = connect_lazily(DownstreamProtocol::Tcp, &address);
        assert_eq!(downstream.address(), address);

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let first = lines.next_line().await.unwrap();
            let second = lines.next_line().await.unwrap();
            (first, second)
        });

        downstream.send(b"{\"sequence\":1}\n").await.unwrap();
        downstream.send(b"{\"sequence\":2}\n").await.unwrap();
        downstream.close().await;

        let (first, second) = accept.await.unwrap();
        assert_eq!(first.as_deref(), Some("{\"sequence\":1}"));
        assert_eq!(second.as_deref(), Some("{\"sequence\":2}"));
    }

    #[tokio::test]
    async fn test_tcp_downstream_reports_refused_connection() {
        // Grab a free port, then close it so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut downstream = TcpDownstream::new(&address);
        let result = downstream.send(b"x\n").await;
        assert!(matches!(result, Err(ForwardError::Connect { .. })));
        assert!(!downstream.is_connected());
    }

    #[tokio::test]
    async fn test_udp_downstream_sends_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = receiver.local_addr().unwrap().to_string();

        let mut downstream = connect_lazily(DownstreamProtocol::Udp, &address);
        downstream.send(b"{\"sequence\":1}\n").await.unwrap();

        let mut buf = [0u8; 64];
        let amt = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..amt], b"{\"sequence\":1}\n");
    }
}
