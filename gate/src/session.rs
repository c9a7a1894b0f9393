//! Per-connection session
//!
//! A session owns one transport link and runs two tasks: the receive task
//! unwhitens and rate-limits client chunks and hands each frame to the
//! router; the send task drains the bounded outbound queue, stamps a
//! [`PacketHead`], whitens with the current keystream and writes to the
//! link. A keystream rotation rides on the outbound frame that announces it
//! and takes effect right after that frame is encoded.
//!
//! State only moves forward (`Established -> AwaitingLogin -> Active ->
//! Closed`) through compare-and-swap, so exactly one caller wins the close.

use crate::cmd_proxy::CmdProxy;
use crate::config::{RECV_RATE_PER_SEC, SEND_QUEUE_LEN, SEND_RATE_PER_SEC};
use crate::context::GateContext;
use crate::rate_limit::RateLimiter;
use crate::router;
use crate::transport::{Inbound, Link, TransportKind};
use log::{debug, info, warn};
use prost::Message;
use shared::frame::{self, FrameError};
use shared::proto::PacketHead;
use shared::{now_ms, CloseReason, Keystream};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Established = 0,
    AwaitingLogin = 1,
    Active = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Established,
            1 => SessionState::AwaitingLogin,
            2 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

/// A frame waiting in the outbound queue
#[derive(Debug)]
pub struct OutboundFrame {
    pub cmd_id: u16,
    pub client_seq: u32,
    pub body: Vec<u8>,
    /// Keystream to install once this frame has been encoded
    pub rotate_to: Option<Keystream>,
}

impl OutboundFrame {
    pub fn new(cmd_id: u16, client_seq: u32, body: Vec<u8>) -> Self {
        Self {
            cmd_id,
            client_seq,
            body,
            rotate_to: None,
        }
    }
}

/// The `PlayerLoginReq` kept for re-driving on a worker change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLogin {
    pub client_seq: u32,
    pub payload: Vec<u8>,
}

pub struct Session {
    id: u32,
    kind: TransportKind,
    peer: SocketAddr,
    state: AtomicU8,

    uid: AtomicU32,
    account_uid: Mutex<String>,
    // 0 means unbound
    game_worker: AtomicU32,
    path_worker: AtomicU32,
    login_req: Mutex<Option<StoredLogin>>,

    server_seq: AtomicU32,
    rtt: Arc<AtomicU32>,
    keystream: RwLock<Arc<Keystream>>,

    outbound: mpsc::Sender<OutboundFrame>,
    closer: Mutex<Option<oneshot::Sender<CloseReason>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("uid", &self.uid())
            .finish()
    }
}

impl Session {
    pub fn new(
        id: u32,
        kind: TransportKind,
        peer: SocketAddr,
        keystream: Arc<Keystream>,
        rtt: Arc<AtomicU32>,
        closer: oneshot::Sender<CloseReason>,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (outbound, queue) = mpsc::channel(SEND_QUEUE_LEN);
        let session = Arc::new(Self {
            id,
            kind,
            peer,
            state: AtomicU8::new(SessionState::Established as u8),
            uid: AtomicU32::new(0),
            account_uid: Mutex::new(String::new()),
            game_worker: AtomicU32::new(0),
            path_worker: AtomicU32::new(0),
            login_req: Mutex::new(None),
            server_seq: AtomicU32::new(0),
            rtt,
            keystream: RwLock::new(keystream),
            outbound,
            closer: Mutex::new(Some(closer)),
            cancel: CancellationToken::new(),
        });
        (session, queue)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn peer_ip(&self) -> String {
        self.peer.ip().to_string()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `from -> to`; false when the session was not in `from`
    pub fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enters `Closed`; only the first caller gets true
    pub fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == SessionState::Closed as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn uid(&self) -> u32 {
        self.uid.load(Ordering::Acquire)
    }

    pub fn set_uid(&self, uid: u32) {
        self.uid.store(uid, Ordering::Release);
    }

    pub fn account_uid(&self) -> String {
        self.account_uid.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_account_uid(&self, account_uid: &str) {
        *self.account_uid.lock().unwrap_or_else(|e| e.into_inner()) = account_uid.to_string();
    }

    pub fn game_worker(&self) -> Option<u32> {
        match self.game_worker.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set_game_worker(&self, worker: Option<u32>) {
        self.game_worker.store(worker.unwrap_or(0), Ordering::Release);
    }

    pub fn path_worker(&self) -> Option<u32> {
        match self.path_worker.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set_path_worker(&self, worker: Option<u32>) {
        self.path_worker.store(worker.unwrap_or(0), Ordering::Release);
    }

    pub fn store_login(&self, login: StoredLogin) {
        *self.login_req.lock().unwrap_or_else(|e| e.into_inner()) = Some(login);
    }

    pub fn stored_login(&self) -> Option<StoredLogin> {
        self.login_req.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Smoothed round trip reported by the transport, in milliseconds
    pub fn rtt(&self) -> u32 {
        self.rtt.load(Ordering::Relaxed)
    }

    pub fn keystream(&self) -> Arc<Keystream> {
        Arc::clone(&self.keystream.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn install_keystream(&self, keystream: Keystream) {
        *self.keystream.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(keystream);
        debug!("Session {} rotated its keystream", self.id);
    }

    /// Queues a frame without waiting; a full queue is the caller's problem
    pub fn try_enqueue(&self, frame: OutboundFrame) -> Result<(), TrySendError<OutboundFrame>> {
        self.outbound.try_send(frame)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Hands the transport its close reason; later calls do nothing
    pub fn close_transport(&self, reason: CloseReason) {
        self.cancel.cancel();
        let closer = self.closer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(closer) = closer {
            let _ = closer.send(reason);
        }
    }

    fn encode_outbound(&self, frame: &OutboundFrame, proxy: Option<&CmdProxy>) -> Result<Vec<u8>, FrameError> {
        let head = PacketHead {
            client_sequence_id: frame.client_seq,
            sent_ms: now_ms(),
            enet_is_reliable: 1,
            server_sequence_id: self.server_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
            ..Default::default()
        };
        let cmd_id = proxy.map_or(frame.cmd_id, |p| p.to_client(frame.cmd_id));
        frame::encode(cmd_id, &head.encode_to_vec(), &frame.body, &self.keystream())
    }
}

/// Registers a session for an accepted link and starts its tasks
pub fn spawn(ctx: &Arc<GateContext>, link: Link) -> Arc<Session> {
    let Link {
        conn_id,
        kind,
        peer,
        inbound,
        outbound,
        closer,
        rtt,
    } = link;

    let keystream = ctx.dispatch_keystream();
    let (session, queue) = Session::new(conn_id, kind, peer, keystream, rtt, closer);
    ctx.registry.insert_session(Arc::clone(&session));
    info!("Session {} opened over {} from {}", conn_id, kind, peer);

    tokio::spawn(send_loop(Arc::clone(ctx), Arc::clone(&session), queue, outbound));
    tokio::spawn(recv_loop(Arc::clone(ctx), Arc::clone(&session), inbound));
    session
}

async fn recv_loop(ctx: Arc<GateContext>, session: Arc<Session>, mut inbound: mpsc::Receiver<Inbound>) {
    let mut limiter = RateLimiter::per_second(RECV_RATE_PER_SEC);
    let idle = ctx.config.read_idle_timeout;

    let reason = 'read: loop {
        let next = tokio::select! {
            _ = session.cancel.cancelled() => return,
            next = tokio::time::timeout(idle, inbound.recv()) => next,
        };

        let chunk = match next {
            Err(_) => {
                info!("Session {} idle for {:?}", session.id(), idle);
                break CloseReason::ServerKick;
            }
            Ok(None) => break CloseReason::ClientClose,
            Ok(Some(Inbound::Closed(reason))) => break reason,
            Ok(Some(Inbound::Message(chunk))) => chunk,
        };

        let frames = match frame::decode(&chunk, &session.keystream()) {
            Ok(frames) => frames,
            Err(FrameError::BodyTooLarge(len)) => {
                warn!("Session {} sent a {} byte body", session.id(), len);
                break CloseReason::ServerKick;
            }
            Err(e) => {
                debug!("Session {} dropped a malformed chunk: {}", session.id(), e);
                continue;
            }
        };

        for frame in frames {
            if !limiter.allow() {
                warn!("Session {} (uid {}) exceeded the receive rate", session.id(), session.uid());
                break 'read CloseReason::PacketFreqTooHigh;
            }
            router::on_client_frame(&ctx, &session, frame).await;
            if session.is_closed() {
                return;
            }
        }
    };

    ctx.close_session(&session, reason).await;
}

async fn send_loop(
    ctx: Arc<GateContext>,
    session: Arc<Session>,
    mut queue: mpsc::Receiver<OutboundFrame>,
    link: mpsc::Sender<Vec<u8>>,
) {
    let mut limiter = RateLimiter::per_second(SEND_RATE_PER_SEC);
    let proxy = ctx.cmd_proxy.as_ref();

    let reason = loop {
        let frame = tokio::select! {
            _ = session.cancel.cancelled() => return,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        if !limiter.allow() {
            warn!("Session {} (uid {}) exceeded the send rate", session.id(), session.uid());
            break CloseReason::PacketFreqTooHigh;
        }

        let bytes = match session.encode_outbound(&frame, proxy) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Session {} dropped outbound cmd {}: {}", session.id(), frame.cmd_id, e);
                continue;
            }
        };
        if let Some(next) = frame.rotate_to {
            session.install_keystream(next);
        }

        match tokio::time::timeout(ctx.config.write_timeout, link.send(bytes)).await {
            Ok(Ok(())) => {}
            // Transport is gone; its close event reaches the receive task
            Ok(Err(_)) => return,
            Err(_) => {
                warn!("Session {} missed the write deadline", session.id());
                break CloseReason::ServerKick;
            }
        }
    };

    ctx.close_session(&session, reason).await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::context::tests::{test_context, test_context_with};
    use crate::context::GateServices;
    use crate::transport::link_pair;
    use shared::proto::cmd;
    use shared::{ProtoFrame, SeedMode};
    use std::time::Duration;

    pub(crate) fn test_session_with_queue(id: u32) -> (Arc<Session>, mpsc::Receiver<OutboundFrame>, oneshot::Receiver<CloseReason>) {
        let (closer, closed) = oneshot::channel();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let keystream = Arc::new(Keystream::derive(1, SeedMode::Normal));
        let (session, queue) = Session::new(id, TransportKind::Tcp, peer, keystream, Arc::new(AtomicU32::new(0)), closer);
        (session, queue, closed)
    }

    pub(crate) fn test_session(id: u32) -> Arc<Session> {
        test_session_with_queue(id).0
    }

    #[test]
    fn test_state_only_advances_from_expected() {
        let session = test_session(1);
        assert_eq!(session.state(), SessionState::Established);
        assert!(!session.advance(SessionState::AwaitingLogin, SessionState::Active));
        assert!(session.advance(SessionState::Established, SessionState::AwaitingLogin));
        assert!(session.advance(SessionState::AwaitingLogin, SessionState::Active));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_close_wins_once() {
        let session = test_session(1);
        assert!(session.begin_close());
        assert!(!session.begin_close());
        assert!(session.is_closed());
        assert!(!session.advance(SessionState::Established, SessionState::AwaitingLogin));
    }

    #[test]
    fn test_worker_bindings() {
        let session = test_session(1);
        assert_eq!(session.game_worker(), None);
        session.set_game_worker(Some(4));
        session.set_path_worker(Some(9));
        assert_eq!(session.game_worker(), Some(4));
        assert_eq!(session.path_worker(), Some(9));
        session.set_path_worker(None);
        assert_eq!(session.path_worker(), None);
    }

    #[test]
    fn test_queue_is_bounded() {
        let (session, _queue, _closed) = test_session_with_queue(1);
        for _ in 0..SEND_QUEUE_LEN {
            session.try_enqueue(OutboundFrame::new(1, 0, vec![])).unwrap();
        }
        assert!(matches!(
            session.try_enqueue(OutboundFrame::new(1, 0, vec![])),
            Err(TrySendError::Full(_))
        ));
    }

    #[tokio::test]
    async fn test_close_transport_sends_reason_once() {
        let (session, _queue, closed) = test_session_with_queue(1);
        session.close_transport(CloseReason::ServerRelogin);
        session.close_transport(CloseReason::ServerKick);
        assert_eq!(closed.await.unwrap(), CloseReason::ServerRelogin);
        assert!(session.cancel_token().is_cancelled());
    }

    #[test]
    fn test_outbound_head_and_proxy() {
        let session = test_session(1);
        let proxy = CmdProxy::parse("PingRsp,20021,21\n").unwrap();
        let frame = OutboundFrame::new(21, 5, b"body".to_vec());

        let first = session.encode_outbound(&frame, Some(&proxy)).unwrap();
        let second = session.encode_outbound(&frame, None).unwrap();

        let decoded = frame::decode(&first, &session.keystream()).unwrap();
        assert_eq!(decoded[0].cmd_id, 20021);
        assert_eq!(decoded[0].body, b"body");
        let head = PacketHead::decode(decoded[0].head.as_slice()).unwrap();
        assert_eq!(head.client_sequence_id, 5);
        assert_eq!(head.server_sequence_id, 1);

        let decoded = frame::decode(&second, &session.keystream()).unwrap();
        assert_eq!(decoded[0].cmd_id, 21);
        let head = PacketHead::decode(decoded[0].head.as_slice()).unwrap();
        assert_eq!(head.server_sequence_id, 2);
    }

    #[test]
    fn test_stored_login() {
        let session = test_session(1);
        assert!(session.stored_login().is_none());
        let login = StoredLogin {
            client_seq: 3,
            payload: vec![1, 2],
        };
        session.store_login(login.clone());
        assert_eq!(session.stored_login(), Some(login));
    }

    #[tokio::test]
    async fn test_receive_rate_closes_with_packet_freq_too_high() {
        let ctx = test_context(GateServices::standalone());
        let (link, mut ends) = link_pair(21, TransportKind::Tcp, "127.0.0.1:40001".parse().unwrap());
        let session = spawn(&ctx, link);
        let keystream = ctx.dispatch_keystream();

        let budget: Vec<ProtoFrame> = (0..RECV_RATE_PER_SEC)
            .map(|_| ProtoFrame::new(cmd::PING_REQ, vec![], vec![]))
            .collect();
        let chunk = frame::encode_batch(&budget, &keystream).unwrap();
        ends.inbound.send(Inbound::Message(chunk)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.is_closed());

        let one_more = frame::encode(cmd::PING_REQ, &[], &[], &keystream).unwrap();
        ends.inbound.send(Inbound::Message(one_more)).await.unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(2), &mut ends.closer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::PacketFreqTooHigh);
        assert!(session.is_closed());
        assert!(ctx.registry.get_by_sid(21).is_none());
    }

    #[tokio::test]
    async fn test_read_idle_closes_with_server_kick() {
        let config = GateConfig {
            read_idle_timeout: Duration::from_millis(50),
            ..GateConfig::loopback()
        };
        let ctx = test_context_with(config, GateServices::standalone());
        let (link, mut ends) = link_pair(22, TransportKind::Udp, "127.0.0.1:40002".parse().unwrap());
        let session = spawn(&ctx, link);
        assert!(ctx.registry.get_by_sid(22).is_some());

        let reason = tokio::time::timeout(Duration::from_secs(2), &mut ends.closer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::ServerKick);
        assert!(session.is_closed());
        assert!(ctx.registry.get_by_sid(22).is_none());
    }
}
