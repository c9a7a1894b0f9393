//! Reliable-UDP listener
//!
//! One task owns the socket. It answers enet connect datagrams, routes
//! segments to the engine task of their conversation, and drops anything it
//! cannot attribute. Each conversation runs its own engine task that feeds
//! [`Kcp`], ticks it every 10 ms and writes its output back to the socket.

use super::{link_pair, Inbound, Link, LinkEnds, TransportKind, UDP_CONV_FLAG};
use crate::error::GateError;
use crate::rate_limit::SharedRateLimiter;
use log::{debug, error, info, trace, warn};
use rand::Rng;
use shared::kcp::peek_conv_token;
use shared::{ByteCheckMode, CloseReason, EnetControl, Kcp, KcpConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const KCP_TICK: Duration = Duration::from_millis(10);
const DATAGRAM_QUEUE_LEN: usize = 256;
const RECV_BUFFER_LEN: usize = 2048;

struct Peer {
    addr: SocketAddr,
    token: u32,
    datagrams: mpsc::Sender<Vec<u8>>,
}

type PeerTable = Arc<Mutex<HashMap<u32, Peer>>>;

fn lock_peers(peers: &PeerTable) -> std::sync::MutexGuard<'_, HashMap<u32, Peer>> {
    peers.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct UdpListener {
    socket: Arc<UdpSocket>,
    byte_check: ByteCheckMode,
    kcp_config: KcpConfig,
    peers: PeerTable,
}

impl UdpListener {
    pub async fn bind(addr: &str, byte_check: ByteCheckMode) -> Result<Self, GateError> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Reliable-UDP listener on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            byte_check,
            kcp_config: KcpConfig::default(),
            peers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves the socket until `shutdown` fires; accepted links go to `accept_tx`
    pub async fn run(self, accept_tx: mpsc::Sender<Link>, connect_limit: SharedRateLimiter, shutdown: CancellationToken) {
        let mut buffer = vec![0u8; RECV_BUFFER_LEN];

        loop {
            let (len, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                },
            };
            let datagram = &buffer[..len];

            if let Some(control) = EnetControl::decode(datagram) {
                self.on_control(control, addr, &connect_limit, &accept_tx).await;
                continue;
            }
            self.on_segment(datagram, addr);
        }
        debug!("Reliable-UDP listener stopped");
    }

    async fn on_control(
        &self,
        control: EnetControl,
        addr: SocketAddr,
        connect_limit: &SharedRateLimiter,
        accept_tx: &mpsc::Sender<Link>,
    ) {
        match control {
            EnetControl::Connect => {
                if !connect_limit.allow() {
                    warn!("Connect rate exceeded, refusing {}", addr);
                    let refuse = EnetControl::Disconnect {
                        conv: 0,
                        token: 0,
                        reason: CloseReason::ServerKick.code(),
                    };
                    self.send_control(refuse, addr).await;
                    return;
                }

                let (link, conv, token) = self.open_conversation(addr);
                self.send_control(EnetControl::Establish { conv, token }, addr).await;
                debug!("Conversation {:#010x} established with {}", conv, addr);

                if accept_tx.send(link).await.is_err() {
                    warn!("Accept loop is gone, dropping conversation {:#010x}", conv);
                }
            }
            EnetControl::Disconnect { conv, token, .. } => {
                let mut peers = lock_peers(&self.peers);
                let owned = peers
                    .get(&conv)
                    .is_some_and(|p| p.addr == addr && p.token == token);
                if owned {
                    peers.remove(&conv);
                    debug!("Client {} disconnected conversation {:#010x}", addr, conv);
                }
            }
            EnetControl::Establish { .. } => {
                trace!("Ignoring establish datagram from {}", addr);
            }
        }
    }

    /// Allocates a conversation and spawns its engine task
    fn open_conversation(&self, addr: SocketAddr) -> (Link, u32, u32) {
        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_QUEUE_LEN);
        let mut rng = rand::thread_rng();
        let token: u32 = rng.gen();

        let conv = {
            let mut peers = lock_peers(&self.peers);
            let conv = loop {
                let candidate = UDP_CONV_FLAG | rng.gen::<u32>();
                if !peers.contains_key(&candidate) {
                    break candidate;
                }
            };
            peers.insert(
                conv,
                Peer {
                    addr,
                    token,
                    datagrams: datagram_tx,
                },
            );
            conv
        };

        let (link, ends) = link_pair(conv, TransportKind::Udp, addr);
        let conversation = Conversation {
            conv,
            token,
            addr,
            socket: Arc::clone(&self.socket),
            byte_check: self.byte_check,
            peers: Arc::clone(&self.peers),
        };
        let kcp = Kcp::new(conv, token, &self.kcp_config);
        tokio::spawn(conversation.run(kcp, datagram_rx, ends));
        (link, conv, token)
    }

    fn on_segment(&self, datagram: &[u8], addr: SocketAddr) {
        let Some(segment) = self.byte_check.open(datagram) else {
            debug!("Byte check failed on datagram from {}", addr);
            return;
        };
        let Some((conv, token)) = peek_conv_token(segment) else {
            trace!("Runt datagram from {}", addr);
            return;
        };

        let peers = lock_peers(&self.peers);
        let Some(peer) = peers.get(&conv) else {
            trace!("Datagram for unknown conversation {:#010x} from {}", conv, addr);
            return;
        };
        if peer.addr != addr || peer.token != token {
            debug!("Conversation {:#010x} spoofed from {}", conv, addr);
            return;
        }
        if peer.datagrams.try_send(segment.to_vec()).is_err() {
            trace!("Conversation {:#010x} input backlog full, dropping", conv);
        }
    }

    async fn send_control(&self, control: EnetControl, addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(&control.encode(), addr).await {
            warn!("Failed to send control datagram to {}: {}", addr, e);
        }
    }
}

struct Conversation {
    conv: u32,
    token: u32,
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
    byte_check: ByteCheckMode,
    peers: PeerTable,
}

impl Conversation {
    async fn run(self, mut kcp: Kcp, mut datagrams: mpsc::Receiver<Vec<u8>>, mut ends: LinkEnds) {
        let started = Instant::now();
        let clock = || started.elapsed().as_millis() as u32;
        kcp.update(clock());

        let mut ticker = tokio::time::interval(KCP_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Some(reason) is reported to the client with a disconnect datagram
        let (notify_client, reason) = loop {
            tokio::select! {
                datagram = datagrams.recv() => match datagram {
                    Some(datagram) => {
                        if let Err(e) = kcp.input(&datagram) {
                            debug!("Conversation {:#010x} rejected segment: {}", self.conv, e);
                            continue;
                        }
                        kcp.update(clock());
                        kcp.flush();
                        self.drain_output(&mut kcp).await;

                        let mut session_gone = false;
                        while let Some(message) = kcp.recv() {
                            if ends.inbound.send(Inbound::Message(message)).await.is_err() {
                                session_gone = true;
                                break;
                            }
                        }
                        if session_gone {
                            break (false, CloseReason::ServerKick);
                        }
                    }
                    // Removed from the peer table by a client disconnect
                    None => break (false, CloseReason::ClientClose),
                },
                message = ends.outbound.recv() => match message {
                    Some(message) => {
                        // Skipping a message would leave a gap in the ordered stream
                        if let Err(e) = kcp.send(&message) {
                            warn!("Conversation {:#010x} cannot send outbound message: {}", self.conv, e);
                            break (true, CloseReason::ServerKick);
                        }
                        kcp.update(clock());
                        kcp.flush();
                        self.drain_output(&mut kcp).await;
                    }
                    None => break (true, CloseReason::ServerKick),
                },
                _ = ticker.tick() => {
                    kcp.update(clock());
                    self.drain_output(&mut kcp).await;
                    ends.rtt.store(kcp.srtt(), Ordering::Relaxed);
                    if kcp.is_dead() {
                        info!("Conversation {:#010x} with {} is dead", self.conv, self.addr);
                        break (true, CloseReason::Timeout);
                    }
                },
                closed = &mut ends.closer => {
                    let reason = closed.unwrap_or(CloseReason::ServerKick);
                    // Push out whatever the session queued before closing
                    while let Ok(message) = ends.outbound.try_recv() {
                        if kcp.send(&message).is_err() {
                            break;
                        }
                    }
                    kcp.update(clock());
                    kcp.flush();
                    self.drain_output(&mut kcp).await;
                    break (true, reason);
                },
            }
        };

        if notify_client {
            let disconnect = EnetControl::Disconnect {
                conv: self.conv,
                token: self.token,
                reason: reason.code(),
            };
            if let Err(e) = self.socket.send_to(&disconnect.encode(), self.addr).await {
                debug!("Failed to send disconnect to {}: {}", self.addr, e);
            }
        }
        let _ = ends.inbound.try_send(Inbound::Closed(reason));

        lock_peers(&self.peers).remove(&self.conv);
        debug!("Conversation {:#010x} closed ({})", self.conv, reason);
    }

    async fn drain_output(&self, kcp: &mut Kcp) {
        while let Some(mut datagram) = kcp.pop_output() {
            self.byte_check.seal(&mut datagram);
            if let Err(e) = self.socket.send_to(&datagram, self.addr).await {
                debug!("Send to {} failed: {}", self.addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONNECT_RATE_PER_SEC;
    use crate::rate_limit::RateLimiter;

    struct TestPeer {
        socket: UdpSocket,
        kcp: Kcp,
        started: Instant,
    }

    impl TestPeer {
        async fn connect(gate: SocketAddr) -> (Self, u32, u32) {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.send_to(&EnetControl::Connect.encode(), gate).await.unwrap();
            let mut buf = [0u8; 64];
            let (len, _) = socket.recv_from(&mut buf).await.unwrap();
            let Some(EnetControl::Establish { conv, token }) = EnetControl::decode(&buf[..len]) else {
                panic!("expected establish");
            };
            let kcp = Kcp::new(conv, token, &KcpConfig::default());
            let peer = Self {
                socket,
                kcp,
                started: Instant::now(),
            };
            (peer, conv, token)
        }

        async fn send(&mut self, gate: SocketAddr, data: &[u8]) {
            self.kcp.send(data).unwrap();
            self.kcp.update(self.started.elapsed().as_millis() as u32);
            self.kcp.flush();
            while let Some(datagram) = self.kcp.pop_output() {
                self.socket.send_to(&datagram, gate).await.unwrap();
            }
        }

        async fn recv(&mut self, gate: SocketAddr) -> Vec<u8> {
            let mut buf = vec![0u8; 2048];
            loop {
                if let Some(message) = self.kcp.recv() {
                    return message;
                }
                let (len, _) = tokio::time::timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                self.kcp.input(&buf[..len]).unwrap();
                self.kcp.update(self.started.elapsed().as_millis() as u32);
                self.kcp.flush();
                while let Some(datagram) = self.kcp.pop_output() {
                    self.socket.send_to(&datagram, gate).await.unwrap();
                }
            }
        }
    }

    async fn start_limited(connect_limit: SharedRateLimiter) -> (SocketAddr, mpsc::Receiver<Link>, CancellationToken) {
        let listener = UdpListener::bind("127.0.0.1:0", ByteCheckMode::None).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accept_tx, accept_rx) = mpsc::channel(256);
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.run(accept_tx, connect_limit, shutdown.clone()));
        (addr, accept_rx, shutdown)
    }

    async fn start() -> (SocketAddr, mpsc::Receiver<Link>, CancellationToken) {
        start_limited(SharedRateLimiter::new(RateLimiter::per_second(CONNECT_RATE_PER_SEC))).await
    }

    async fn next_control(socket: &UdpSocket) -> EnetControl {
        let mut buf = [0u8; 2048];
        loop {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if let Some(control) = EnetControl::decode(&buf[..len]) {
                return control;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_allocates_flagged_conv() {
        let (gate, mut accepted, shutdown) = start().await;
        let (_peer, conv, _) = TestPeer::connect(gate).await;
        assert_ne!(conv & UDP_CONV_FLAG, 0);

        let link = accepted.recv().await.unwrap();
        assert_eq!(link.conn_id, conv);
        assert_eq!(link.kind, TransportKind::Udp);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (gate, mut accepted, shutdown) = start().await;
        let (mut peer, _, _) = TestPeer::connect(gate).await;
        let mut link = accepted.recv().await.unwrap();

        peer.send(gate, b"hello gate").await;
        let inbound = tokio::time::timeout(Duration::from_secs(2), link.inbound.recv())
            .await
            .unwrap();
        assert_eq!(inbound, Some(Inbound::Message(b"hello gate".to_vec())));

        link.outbound.send(b"hello client".to_vec()).await.unwrap();
        assert_eq!(peer.recv(gate).await, b"hello client".to_vec());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_close_sends_disconnect_with_reason() {
        let (gate, mut accepted, shutdown) = start().await;
        let (peer, conv, token) = TestPeer::connect(gate).await;
        let link = accepted.recv().await.unwrap();

        link.closer.send(CloseReason::ServerRelogin).unwrap();
        let mut buf = [0u8; 2048];
        loop {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if let Some(control) = EnetControl::decode(&buf[..len]) {
                assert_eq!(
                    control,
                    EnetControl::Disconnect {
                        conv,
                        token,
                        reason: CloseReason::ServerRelogin.code()
                    }
                );
                break;
            }
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_client_disconnect_reaches_session() {
        let (gate, mut accepted, shutdown) = start().await;
        let (peer, conv, token) = TestPeer::connect(gate).await;
        let mut link = accepted.recv().await.unwrap();

        let bye = EnetControl::Disconnect {
            conv,
            token,
            reason: CloseReason::ClientClose.code(),
        };
        peer.socket.send_to(&bye.encode(), gate).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), link.inbound.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(Inbound::Closed(CloseReason::ClientClose)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_wrong_token_is_ignored() {
        let (gate, mut accepted, shutdown) = start().await;
        let (peer, conv, token) = TestPeer::connect(gate).await;
        let mut link = accepted.recv().await.unwrap();

        let mut forged = Kcp::new(conv, token ^ 1, &KcpConfig::default());
        forged.send(b"forged").unwrap();
        forged.update(0);
        forged.flush();
        while let Some(datagram) = forged.pop_output() {
            peer.socket.send_to(&datagram, gate).await.unwrap();
        }

        let nothing = tokio::time::timeout(Duration::from_millis(100), link.inbound.recv()).await;
        assert!(nothing.is_err());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_connect_over_rate_is_refused_with_server_kick() {
        let limit = SharedRateLimiter::new(RateLimiter::new(CONNECT_RATE_PER_SEC, Duration::from_secs(60)));
        let (gate, mut accepted, shutdown) = start_limited(limit).await;

        let mut peers = Vec::new();
        for _ in 0..CONNECT_RATE_PER_SEC {
            let (peer, _, _) = TestPeer::connect(gate).await;
            peers.push(peer);
            accepted.recv().await.unwrap();
        }

        let late = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        late.send_to(&EnetControl::Connect.encode(), gate).await.unwrap();
        assert_eq!(
            next_control(&late).await,
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

    #[tokio::test]
    async fn test_unsendable_message_closes_conversation() {
        let (gate, mut accepted, shutdown) = start().await;
        let (peer, conv, token) = TestPeer::connect(gate).await;
        let mut link = accepted.recv().await.unwrap();

        let too_large = Kcp::new(conv, token, &KcpConfig::default()).max_message_len() + 1;
        link.outbound.send(vec![0x5A; too_large]).await.unwrap();

        assert_eq!(
            next_control(&peer.socket).await,
            EnetControl::Disconnect {
                conv,
                token,
                reason: CloseReason::ServerKick.code()
            }
        );
        let event = tokio::time::timeout(Duration::from_secs(2), link.inbound.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(Inbound::Closed(CloseReason::ServerKick)));
        shutdown.cancel();
    }
}
