//! Routing between sessions and the bus
//!
//! Client frames are routed on `(session state, cmd_id)`; anything the table
//! does not name is dropped. Bus envelopes arrive through one forwarding
//! task subscribed to `gate.broadcast` and `gate.{gate_id}`, so envelopes
//! for one uid are delivered in publish order.

use crate::context::GateContext;
use crate::handshake;
use crate::session::{OutboundFrame, Session, SessionState, StoredLogin};
use futures::stream::{self, StreamExt};
use log::{debug, info, trace, warn};
use prost::Message;
use shared::envelope::{gate_topic, game_topic, path_topic, ConnCtrl, ConnCtrlKind, GameMsg, ServerMsg, ServerMsgKind, GATE_BROADCAST};
use shared::proto::{cmd, decode_head, PlayerLoginRsp};
use shared::{CloseReason, Envelope, ProtoFrame, Retcode};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Routes one frame received from a client
pub async fn on_client_frame(ctx: &Arc<GateContext>, session: &Arc<Session>, frame: ProtoFrame) {
    let cmd_id = match &ctx.cmd_proxy {
        Some(proxy) => proxy.to_server(frame.cmd_id),
        None => frame.cmd_id,
    };
    let client_seq = decode_head(&frame.head)
        .map(|head| head.client_sequence_id)
        .unwrap_or(0);

    match (session.state(), cmd_id) {
        (SessionState::Established, cmd::GET_PLAYER_TOKEN_REQ) => {
            handshake::on_token_req(ctx, session, client_seq, &frame.body).await;
        }
        (SessionState::AwaitingLogin, cmd::PLAYER_LOGIN_REQ) => {
            let login = StoredLogin {
                client_seq,
                payload: frame.body,
            };
            session.store_login(login.clone());
            forward_login(ctx, session, &login).await;
        }
        (SessionState::Active, cmd::PLAYER_FORCE_EXIT_REQ) => {
            info!("uid {} asked to exit", session.uid());
            ctx.close_session(session, CloseReason::ClientClose).await;
        }
        (SessionState::Active, cmd_id) => {
            forward_to_workers(ctx, session, cmd_id, client_seq, frame.body).await;
        }
        (state, cmd_id) => {
            trace!("Session {} dropped cmd {} in state {:?}", session.id(), cmd_id, state);
        }
    }
}

async fn forward_login(ctx: &GateContext, session: &Session, login: &StoredLogin) {
    let Some(worker) = session.game_worker() else {
        warn!("Session {} has no game worker for its login", session.id());
        return;
    };
    let msg = GameMsg {
        uid: session.uid(),
        cmd_id: cmd::PLAYER_LOGIN_REQ,
        client_seq: login.client_seq,
        payload: login.payload.clone(),
        gate_id: ctx.gate_id,
    };
    ctx.publish(&game_topic(worker), &Envelope::GameMsg(msg)).await;
}

async fn forward_to_workers(ctx: &GateContext, session: &Session, cmd_id: u16, client_seq: u32, payload: Vec<u8>) {
    let uid = session.uid();
    let Some(game) = session.game_worker() else {
        warn!("uid {} is active without a game worker", uid);
        return;
    };

    if cmd::is_path_cmd(cmd_id) {
        if let Some(path) = session.path_worker() {
            let copy = GameMsg {
                uid,
                cmd_id,
                client_seq,
                payload: payload.clone(),
                gate_id: ctx.gate_id,
            };
            ctx.publish(&path_topic(path), &Envelope::GameMsg(copy)).await;
        }
    }
    if cmd_id == cmd::PING_REQ {
        ctx.publish(&game_topic(game), &Envelope::client_rtt(uid, session.rtt(), ctx.gate_id))
            .await;
    }

    let msg = GameMsg {
        uid,
        cmd_id,
        client_seq,
        payload,
        gate_id: ctx.gate_id,
    };
    ctx.publish(&game_topic(game), &Envelope::GameMsg(msg)).await;
}

/// Handles one envelope delivered to this gateway
pub async fn on_envelope(ctx: &Arc<GateContext>, envelope: Envelope) {
    match envelope {
        Envelope::GameMsg(msg) => on_game_msg(ctx, msg).await,
        Envelope::ConnCtrl(ctrl) => on_conn_ctrl(ctx, ctrl).await,
        Envelope::ServerMsg(msg) => on_server_msg(ctx, msg).await,
    }
}

async fn on_game_msg(ctx: &Arc<GateContext>, msg: GameMsg) {
    let Some(session) = ctx.registry.get_by_uid(msg.uid) else {
        trace!("No session for uid {}, dropping cmd {}", msg.uid, msg.cmd_id);
        return;
    };

    if msg.cmd_id == cmd::PLAYER_LOGIN_RSP {
        let accepted = PlayerLoginRsp::decode(msg.payload.as_slice())
            .map(|rsp| rsp.retcode == Retcode::Succ.code())
            .unwrap_or(false);
        if accepted && session.advance(SessionState::AwaitingLogin, SessionState::Active) {
            info!("uid {} is active on session {}", msg.uid, session.id());
            if let Some(game) = session.game_worker() {
                let bound = Envelope::workers_bound(msg.uid, game, session.path_worker(), ctx.gate_id);
                ctx.publish(&game_topic(game), &bound).await;
            }
        }
    }

    ctx.send_frame(&session, OutboundFrame::new(msg.cmd_id, msg.client_seq, msg.payload))
        .await;
}

async fn on_conn_ctrl(ctx: &Arc<GateContext>, ctrl: ConnCtrl) {
    match ctrl.kind {
        ConnCtrlKind::KickPlayer => {
            if ctrl.gate_id == ctx.gate_id {
                return;
            }
            let Some(session) = ctx.registry.get_by_uid(ctrl.uid) else {
                return;
            };
            let reason = ctrl.reason.unwrap_or(CloseReason::ServerKick);
            info!("Gate {} kicked uid {} ({})", ctrl.gate_id, ctrl.uid, reason);
            ctx.close_session(&session, reason).await;
        }
        ConnCtrlKind::UserOffline | ConnCtrlKind::ClientRtt => {
            trace!("Ignoring {:?} for uid {}", ctrl.kind, ctrl.uid);
        }
    }
}

async fn on_server_msg(ctx: &Arc<GateContext>, msg: ServerMsg) {
    match msg.kind {
        ServerMsgKind::WorkerChange => {
            let Some(session) = ctx.registry.get_by_uid(msg.uid) else {
                return;
            };
            let Some(game) = msg.game_worker_id else {
                warn!("Worker change for uid {} without a game worker", msg.uid);
                return;
            };
            session.set_game_worker(Some(game));
            if msg.path_worker_id.is_some() {
                session.set_path_worker(msg.path_worker_id);
            }
            info!("uid {} moved to game worker {}", msg.uid, game);

            if let Some(login) = session.stored_login() {
                forward_login(ctx, &session, &login).await;
            }
        }
        ServerMsgKind::PresenceChange => {
            let (Some(gate_id), Some(online)) = (msg.gate_id, msg.online) else {
                return;
            };
            if gate_id == ctx.gate_id {
                return;
            }
            ctx.registry.apply_presence(msg.uid, gate_id, online);
            if !online {
                ctx.registry.fulfil_kick_waiter(msg.uid);
            }
        }
        ServerMsgKind::WorkersBound => {}
    }
}

/// Starts the task that feeds bus envelopes into [`on_envelope`]
pub async fn spawn_forwarding(
    ctx: &Arc<GateContext>,
    stop: CancellationToken,
) -> Result<JoinHandle<()>, crate::error::GateError> {
    let broadcast = ctx.bus.subscribe(GATE_BROADCAST).await?;
    let direct = ctx.bus.subscribe(&gate_topic(ctx.gate_id)).await?;
    let mut envelopes = stream::select_all([broadcast, direct]);

    let ctx = Arc::clone(ctx);
    Ok(tokio::spawn(async move {
        loop {
            // Envelopes already delivered are handled before `stop` is honoured
            let payload = tokio::select! {
                biased;
                payload = envelopes.next() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
                _ = stop.cancelled() => break,
            };
            match Envelope::from_bytes(&payload) {
                Ok(envelope) => on_envelope(&ctx, envelope).await,
                Err(e) => warn!("Dropping undecodable envelope: {}", e),
            }
        }
        debug!("Forwarding task stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::context::GateServices;
    use crate::session::tests::test_session_with_queue;
    use crate::bus::BusStream;
    use shared::proto::PacketHead;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn frame(cmd_id: u16, client_seq: u32, body: &[u8]) -> ProtoFrame {
        let head = PacketHead {
            client_sequence_id: client_seq,
            ..Default::default()
        };
        ProtoFrame::new(cmd_id, head.encode_to_vec(), body.to_vec())
    }

    fn active_session(ctx: &GateContext, sid: u32, uid: u32) -> (Arc<Session>, mpsc::Receiver<OutboundFrame>) {
        let (session, queue, _closed) = test_session_with_queue(sid);
        session.set_uid(uid);
        session.set_game_worker(Some(2));
        session.set_path_worker(Some(3));
        ctx.registry.insert_session(Arc::clone(&session));
        ctx.registry.bind_uid(uid, &session);
        assert!(session.advance(SessionState::Established, SessionState::AwaitingLogin));
        assert!(session.advance(SessionState::AwaitingLogin, SessionState::Active));
        (session, queue)
    }

    async fn next_envelope(stream: &mut BusStream) -> Envelope {
        let payload = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        Envelope::from_bytes(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_established_drops_app_frames() {
        let services = GateServices::standalone();
        let ctx = test_context(services.clone());
        let mut game = services.bus.subscribe(&game_topic(2)).await.unwrap();
        let (session, _queue, _closed) = test_session_with_queue(1);
        session.set_game_worker(Some(2));

        on_client_frame(&ctx, &session, frame(cmd::PING_REQ, 1, b"")).await;
        let nothing = tokio::time::timeout(Duration::from_millis(50), game.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_active_frames_reach_game_worker_in_order() {
        let services = GateServices::standalone();
        let ctx = test_context(services.clone());
        let mut game = services.bus.subscribe(&game_topic(2)).await.unwrap();
        let (session, _queue) = active_session(&ctx, 1, 10001);

        for seq in 1..=3u32 {
            on_client_frame(&ctx, &session, frame(500, seq, &[seq as u8])).await;
        }
        for seq in 1..=3u32 {
            let Envelope::GameMsg(msg) = next_envelope(&mut game).await else {
                panic!("expected a game message");
            };
            assert_eq!(msg.uid, 10001);
            assert_eq!(msg.cmd_id, 500);
            assert_eq!(msg.client_seq, seq);
            assert_eq!(msg.payload, vec![seq as u8]);
            assert_eq!(msg.gate_id, 1);
        }
    }

    #[tokio::test]
    async fn test_path_cmds_fan_out() {
        let services = GateServices::standalone();
        let ctx = test_context(services.clone());
        let mut game = services.bus.subscribe(&game_topic(2)).await.unwrap();
        let mut path = services.bus.subscribe(&path_topic(3)).await.unwrap();
        let (session, _queue) = active_session(&ctx, 1, 10001);

        on_client_frame(&ctx, &session, frame(cmd::QUERY_PATH_REQ, 4, b"q")).await;
        assert!(matches!(next_envelope(&mut path).await, Envelope::GameMsg(m) if m.cmd_id == cmd::QUERY_PATH_REQ));
        assert!(matches!(next_envelope(&mut game).await, Envelope::GameMsg(m) if m.cmd_id == cmd::QUERY_PATH_REQ));
    }

    #[tokio::test]
    async fn test_ping_reports_rtt() {
        let services = GateServices::standalone();
        let ctx = test_context(services.clone());
        let mut game = services.bus.subscribe(&game_topic(2)).await.unwrap();
        let (session, _queue) = active_session(&ctx, 1, 10001);

        on_client_frame(&ctx, &session, frame(cmd::PING_REQ, 1, b"")).await;
        assert_eq!(next_envelope(&mut game).await, Envelope::client_rtt(10001, 0, 1));
        assert!(matches!(next_envelope(&mut game).await, Envelope::GameMsg(m) if m.cmd_id == cmd::PING_REQ));
    }

    #[tokio::test]
    async fn test_force_exit_closes() {
        let ctx = test_context(GateServices::standalone());
        let (session, _queue) = active_session(&ctx, 1, 10001);
        on_client_frame(&ctx, &session, frame(cmd::PLAYER_FORCE_EXIT_REQ, 1, b"")).await;
        assert!(session.is_closed());
        assert!(ctx.registry.get_by_uid(10001).is_none());
    }

    #[tokio::test]
    async fn test_login_rsp_activates_session() {
        let services = GateServices::standalone();
        let ctx = test_context(services.clone());
        let mut game = services.bus.subscribe(&game_topic(2)).await.unwrap();

        let (session, mut queue, _closed) = test_session_with_queue(1);
        session.set_uid(10001);
        session.set_game_worker(Some(2));
        ctx.registry.insert_session(Arc::clone(&session));
        ctx.registry.bind_uid(10001, &session);
        session.advance(SessionState::Established, SessionState::AwaitingLogin);

        on_client_frame(&ctx, &session, frame(cmd::PLAYER_LOGIN_REQ, 2, b"login")).await;
        let Envelope::GameMsg(login) = next_envelope(&mut game).await else {
            panic!("expected the login request");
        };
        assert_eq!(login.cmd_id, cmd::PLAYER_LOGIN_REQ);
        assert_eq!(login.payload, b"login");

        let rsp = PlayerLoginRsp::default().encode_to_vec();
        let reply = GameMsg {
            uid: 10001,
            cmd_id: cmd::PLAYER_LOGIN_RSP,
            client_seq: 2,
            payload: rsp.clone(),
            gate_id: 1,
        };
        on_envelope(&ctx, Envelope::GameMsg(reply)).await;

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(next_envelope(&mut game).await, Envelope::workers_bound(10001, 2, None, 1));
        let out = queue.recv().await.unwrap();
        assert_eq!(out.cmd_id, cmd::PLAYER_LOGIN_RSP);
        assert_eq!(out.body, rsp);
    }

    #[tokio::test]
    async fn test_failed_login_rsp_stays_awaiting() {
        let ctx = test_context(GateServices::standalone());
        let (session, mut queue, _closed) = test_session_with_queue(1);
        session.set_uid(10001);
        ctx.registry.bind_uid(10001, &session);
        session.advance(SessionState::Established, SessionState::AwaitingLogin);

        let rsp = PlayerLoginRsp {
            retcode: 1,
            ..Default::default()
        };
        let reply = GameMsg {
            uid: 10001,
            cmd_id: cmd::PLAYER_LOGIN_RSP,
            client_seq: 2,
            payload: rsp.encode_to_vec(),
            gate_id: 1,
        };
        on_envelope(&ctx, Envelope::GameMsg(reply)).await;
        assert_eq!(session.state(), SessionState::AwaitingLogin);
        assert!(queue.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_kick_from_other_gate_closes_with_reason() {
        let ctx = test_context(GateServices::standalone());
        let (session, _queue, closed) = test_session_with_queue(1);
        session.set_uid(10001);
        ctx.registry.insert_session(Arc::clone(&session));
        ctx.registry.bind_uid(10001, &session);

        on_envelope(&ctx, Envelope::kick_player(10001, CloseReason::ServerRelogin, 1)).await;
        assert!(!session.is_closed());

        on_envelope(&ctx, Envelope::kick_player(10001, CloseReason::ServerRelogin, 2)).await;
        assert!(session.is_closed());
        assert_eq!(closed.await.unwrap(), CloseReason::ServerRelogin);
    }

    #[tokio::test]
    async fn test_worker_change_redrives_login() {
        let services = GateServices::standalone();
        let ctx = test_context(services.clone());
        let mut new_game = services.bus.subscribe(&game_topic(8)).await.unwrap();
        let (session, _queue) = active_session(&ctx, 1, 10001);
        session.store_login(StoredLogin {
            client_seq: 2,
            payload: b"login".to_vec(),
        });

        on_envelope(&ctx, Envelope::worker_change(10001, 8)).await;
        assert_eq!(session.game_worker(), Some(8));
        assert_eq!(session.path_worker(), Some(3));

        let Envelope::GameMsg(msg) = next_envelope(&mut new_game).await else {
            panic!("expected the re-driven login");
        };
        assert_eq!(msg.cmd_id, cmd::PLAYER_LOGIN_REQ);
        assert_eq!(msg.client_seq, 2);
    }

    #[tokio::test]
    async fn test_remote_presence_fulfils_waiter() {
        let ctx = test_context(GateServices::standalone());
        on_envelope(&ctx, Envelope::presence_change(10001, 5, true)).await;
        assert_eq!(ctx.registry.fleet_owner(10001), Some(5));

        let waiter = ctx.registry.register_kick_waiter(10001);
        on_envelope(&ctx, Envelope::presence_change(10001, 5, false)).await;
        assert_eq!(ctx.registry.fleet_owner(10001), None);
        assert!(waiter.await.is_ok());
    }

    #[tokio::test]
    async fn test_forwarding_task_delivers_direct_topic() {
        let services = GateServices::standalone();
        let ctx = test_context(services.clone());
        let (session, mut queue) = active_session(&ctx, 1, 10001);
        let stop = CancellationToken::new();
        let forwarding = spawn_forwarding(&ctx, stop.clone()).await.unwrap();

        let msg = GameMsg {
            uid: 10001,
            cmd_id: cmd::PING_RSP,
            client_seq: 1,
            payload: vec![7],
            gate_id: 1,
        };
        services
            .bus
            .publish(&gate_topic(1), &Envelope::GameMsg(msg))
            .await
            .unwrap();
        let out = tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.cmd_id, cmd::PING_RSP);
        assert!(!session.is_closed());

        stop.cancel();
        forwarding.await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarding_drains_before_stopping() {
        let services = GateServices::standalone();
        let ctx = test_context(services.clone());
        let (_session, mut queue) = active_session(&ctx, 1, 10001);
        let stop = CancellationToken::new();
        let forwarding = spawn_forwarding(&ctx, stop.clone()).await.unwrap();

        for seq in 1..=3 {
            let msg = GameMsg {
                uid: 10001,
                cmd_id: cmd::PING_RSP,
                client_seq: seq,
                payload: vec![],
                gate_id: 1,
            };
            services
                .bus
                .publish(&gate_topic(1), &Envelope::GameMsg(msg))
                .await
                .unwrap();
        }
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), forwarding)
            .await
            .unwrap()
            .unwrap();

        for seq in 1..=3 {
            assert_eq!(queue.try_recv().unwrap().client_seq, seq);
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_does_not_stop_forwarding() {
        let services = GateServices::standalone();
        let ctx = test_context(services.clone());
        let (_session, mut queue) = active_session(&ctx, 1, 10001);
        let stop = CancellationToken::new();
        let forwarding = spawn_forwarding(&ctx, stop.clone()).await.unwrap();

        ctx.shutdown.cancel();
        let msg = GameMsg {
            uid: 10001,
            cmd_id: cmd::PING_RSP,
            client_seq: 9,
            payload: vec![],
            gate_id: 1,
        };
        services
            .bus
            .publish(&gate_topic(1), &Envelope::GameMsg(msg))
            .await
            .unwrap();
        let out = tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.client_seq, 9);

        stop.cancel();
        forwarding.await.unwrap();
    }
}
