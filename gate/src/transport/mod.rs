//! Transport listeners
//!
//! Both listeners turn connections into [`Link`]s: a pair of channels
//! carrying whole transport messages (one reassembled reliable-UDP message or
//! one TCP chunk), a one-shot used by the session to close the connection
//! with a reason, and a shared RTT cell the transport keeps current. When the
//! transport itself ends a connection it says why with [`Inbound::Closed`].
//!
//! UDP conversation ids always have the top bit set; TCP connection ids come
//! from a counter below `0x8000_0000`. The two id spaces never overlap.

pub mod tcp;
pub mod udp;

use shared::CloseReason;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Top bit of every UDP conversation id
pub const UDP_CONV_FLAG: u32 = 0x8000_0000;

/// Capacity of the per-link byte channels
pub const LINK_CHANNEL_LEN: usize = 1024;

/// What a transport hands up to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(Vec<u8>),
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Udp => f.write_str("udp"),
            TransportKind::Tcp => f.write_str("tcp"),
        }
    }
}

/// An accepted connection handed to the session layer
#[derive(Debug)]
pub struct Link {
    pub conn_id: u32,
    pub kind: TransportKind,
    pub peer: SocketAddr,
    /// Messages from the client; closes when the connection ends
    pub inbound: mpsc::Receiver<Inbound>,
    /// Messages to the client
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Closes the connection, telling the client why when the transport can
    pub closer: oneshot::Sender<CloseReason>,
    /// Latest round-trip estimate in milliseconds
    pub rtt: Arc<AtomicU32>,
}

/// Transport-side ends of a [`Link`]
pub(crate) struct LinkEnds {
    pub inbound: mpsc::Sender<Inbound>,
    pub outbound: mpsc::Receiver<Vec<u8>>,
    pub closer: oneshot::Receiver<CloseReason>,
    pub rtt: Arc<AtomicU32>,
}

pub(crate) fn link_pair(conn_id: u32, kind: TransportKind, peer: SocketAddr) -> (Link, LinkEnds) {
    let (in_tx, in_rx) = mpsc::channel(LINK_CHANNEL_LEN);
    let (out_tx, out_rx) = mpsc::channel(LINK_CHANNEL_LEN);
    let (close_tx, close_rx) = oneshot::channel();
    let rtt = Arc::new(AtomicU32::new(0));

    let link = Link {
        conn_id,
        kind,
        peer,
        inbound: in_rx,
        outbound: out_tx,
        closer: close_tx,
        rtt: Arc::clone(&rtt),
    };
    let ends = LinkEnds {
        inbound: in_tx,
        outbound: out_rx,
        closer: close_rx,
        rtt,
    };
    (link, ends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{RateLimiter, SharedRateLimiter};
    use shared::{ByteCheckMode, EnetControl};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpStream, UdpSocket};
    use tokio_util::sync::CancellationToken;

    async fn udp_connect(gate: SocketAddr) -> EnetControl {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&EnetControl::Connect.encode(), gate).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        EnetControl::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_link_pair_is_wired() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let (mut link, mut ends) = link_pair(7, TransportKind::Tcp, peer);

        ends.inbound.send(Inbound::Message(vec![1])).await.unwrap();
        assert_eq!(link.inbound.recv().await, Some(Inbound::Message(vec![1])));

        link.outbound.send(vec![2]).await.unwrap();
        assert_eq!(ends.outbound.recv().await, Some(vec![2]));

        ends.rtt.store(42, Ordering::Relaxed);
        assert_eq!(link.rtt.load(Ordering::Relaxed), 42);

        link.closer.send(CloseReason::ServerKick).unwrap();
        assert_eq!(ends.closer.await.unwrap(), CloseReason::ServerKick);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::Udp.to_string(), "udp");
        assert_eq!(TransportKind::Tcp.to_string(), "tcp");
    }

    #[tokio::test]
    async fn test_connect_budget_is_shared_by_both_listeners() {
        let udp = udp::UdpListener::bind("127.0.0.1:0", ByteCheckMode::None).await.unwrap();
        let tcp = tcp::TcpListener::bind("127.0.0.1:0", Duration::from_secs(1)).await.unwrap();
        let udp_addr = udp.local_addr().unwrap();
        let tcp_addr = tcp.local_addr().unwrap();

        let (accept_tx, mut accepted) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let connect_limit = SharedRateLimiter::new(RateLimiter::new(4, Duration::from_secs(60)));
        tokio::spawn(udp.run(accept_tx.clone(), connect_limit.clone(), shutdown.clone()));
        tokio::spawn(tcp.run(accept_tx, connect_limit, shutdown.clone()));

        for _ in 0..2 {
            assert!(matches!(udp_connect(udp_addr).await, EnetControl::Establish { .. }));
        }
        let mut kept = Vec::new();
        for _ in 0..2 {
            kept.push(TcpStream::connect(tcp_addr).await.unwrap());
        }
        for _ in 0..4 {
            tokio::time::timeout(Duration::from_secs(2), accepted.recv())
                .await
                .unwrap()
                .unwrap();
        }

        // Budget spent: TCP is dropped, UDP is told to go away
        let mut refused = TcpStream::connect(tcp_addr).await.unwrap();
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), refused.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.map(|n| n == 0).unwrap_or(true));

        assert_eq!(
            udp_connect(udp_addr).await,
            EnetControl::Disconnect {
                conv: 0,
                token: 0,
                reason: CloseReason::ServerKick.code()
            }
        );
        let nothing = tokio::time::timeout(Duration::from_millis(50), accepted.recv()).await;
        assert!(nothing.is_err());
        shutdown.cancel();
    }
}
