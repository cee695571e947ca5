//! Datagram transport capability
//!
//! The engine never owns a socket directly: it pushes and pulls datagrams
//! through a `TransportSink` injected at construction. Implementations
//! must preserve send order per remote endpoint.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// Capability interface over the underlying datagram socket
#[async_trait]
pub trait TransportSink: Send + Sync {
    /// Send one datagram to a remote endpoint
    async fn send(&self, to: SocketAddr, datagram: Bytes) -> Result<(), TransportError>;

    /// Receive the next datagram and its source endpoint
    async fn recv(&self) -> Result<(SocketAddr, Bytes), TransportError>;
}

/// UDP-backed transport
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a UDP socket on the given local address
    pub async fn bind(local: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        Ok(UdpTransport { socket })
    }

    /// The bound local address
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }
}

#[async_trait]
impl TransportSink for UdpTransport {
    async fn send(&self, to: SocketAddr, datagram: Bytes) -> Result<(), TransportError> {
        self.socket
            .send_to(&datagram, to)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<(SocketAddr, Bytes), TransportError> {
        let mut buf = vec![0u8; 2048];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        buf.truncate(len);
        Ok((from, Bytes::from(buf)))
    }
}

/// In-process loopback transport for tests and local pipelines
///
/// `loopback_pair` yields two connected halves; datagrams sent on one are
/// received on the other, in order.
pub struct LoopbackTransport {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    rx: Mutex<mpsc::UnboundedReceiver<(SocketAddr, Bytes)>>,
}

/// Create two connected loopback transports
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let addr_a = SocketAddr::from(([127, 0, 0, 1], 10001));
    let addr_b = SocketAddr::from(([127, 0, 0, 1], 10002));
    let (tx_ab, rx_ab) = mpsc::unbounded_channel();
    let (tx_ba, rx_ba) = mpsc::unbounded_channel();

    let a = LoopbackTransport {
        addr: addr_a,
        tx: tx_ab,
        rx: Mutex::new(rx_ba),
    };
    let b = LoopbackTransport {
        addr: addr_b,
        tx: tx_ba,
        rx: Mutex::new(rx_ab),
    };
    (a, b)
}

impl LoopbackTransport {
    /// The synthetic address of this half
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl TransportSink for LoopbackTransport {
    async fn send(&self, _to: SocketAddr, datagram: Bytes) -> Result<(), TransportError> {
        self.tx
            .send((self.addr, datagram))
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<(SocketAddr, Bytes), TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_preserves_order() {
        let (a, b) = loopback_pair();
        let to = b.local_addr();

        for i in 0..10u8 {
            a.send(to, Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            let (from, datagram) = b.recv().await.unwrap();
            assert_eq!(from, a.local_addr());
            assert_eq!(datagram[0], i);
        }
    }

    #[tokio::test]
    async fn test_loopback_bidirectional() {
        let (a, b) = loopback_pair();
        a.send(b.local_addr(), Bytes::from_static(b"ping")).await.unwrap();
        let (_, ping) = b.recv().await.unwrap();
        assert_eq!(&ping[..], b"ping");

        b.send(a.local_addr(), Bytes::from_static(b"pong")).await.unwrap();
        let (_, pong) = a.recv().await.unwrap();
        assert_eq!(&pong[..], b"pong");
    }

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        a.send(b.local_addr().unwrap(), Bytes::from_static(b"datagram"))
            .await
            .unwrap();
        let (from, received) = b.recv().await.unwrap();
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(&received[..], b"datagram");
    }
}
