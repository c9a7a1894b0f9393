//! `GetPlayerTokenReq` handling
//!
//! The engine runs the login checks in a fixed order and answers with a
//! `GetPlayerTokenRsp` either way:
//!
//! 1. identity verification
//! 2. the per-account login lock (held until the engine returns)
//! 3. `account_uid -> uid` resolution and the ban check
//! 4. the stop-server window and its allow-list
//! 5. the session cap
//! 6. fleet-wide single login: the previous session is kicked and the engine
//!    waits for it to go offline
//! 7. worker binding
//! 8. seed exchange
//! 9. keystream rotation, carried by the response frame
//! 10. binding the session into the tables and announcing presence
//!
//! A refused request leaves the session `Established` with its keystream
//! untouched, so the client may retry.

use crate::accounts::Account;
use crate::context::GateContext;
use crate::crypto::{random_bytes, random_cookie, time_seed};
use crate::error::HandshakeError;
use crate::login_lock::LoginLockGuard;
use crate::session::{OutboundFrame, Session, SessionState};
use log::{debug, info, warn};
use prost::Message;
use shared::envelope::GATE_BROADCAST;
use shared::proto::{cmd, GetPlayerTokenReq, GetPlayerTokenRsp};
use shared::{CloseReason, Envelope, Keystream, Retcode, SeedMode};
use std::sync::Arc;

const ACCOUNT_TYPE: u32 = 1;
const CHANNEL_ID: u32 = 1;
const PLATFORM_TYPE: u32 = 3;
const SECURITY_CMD_BUFFER_LEN: usize = 32;

fn unix_now() -> u32 {
    (shared::now_ms() / 1000) as u32
}

/// Seed exchange output that goes into the response
#[derive(Debug, Default)]
struct KeyFields {
    secret_key_seed: u64,
    secret_key: String,
    key_id: u32,
    server_rand_key: String,
    sign: String,
}

struct Granted {
    rsp: GetPlayerTokenRsp,
    keystream: Keystream,
}

/// Answers one `GetPlayerTokenReq` on `session`
pub async fn on_token_req(ctx: &Arc<GateContext>, session: &Arc<Session>, client_seq: u32, body: &[u8]) {
    let outcome = match GetPlayerTokenReq::decode(body) {
        Ok(req) => run(ctx, session, &req).await,
        Err(e) => Err(HandshakeError::BadRequest(e.to_string())),
    };

    let frame = match outcome {
        Ok(Granted { rsp, keystream }) => {
            info!(
                "Session {} logged in as uid {} (account {})",
                session.id(),
                rsp.uid,
                rsp.account_uid
            );
            OutboundFrame {
                cmd_id: cmd::GET_PLAYER_TOKEN_RSP,
                client_seq,
                body: rsp.encode_to_vec(),
                rotate_to: Some(keystream),
            }
        }
        Err(e) => {
            let retcode = e.retcode();
            warn!("Session {} login refused with {}: {}", session.id(), retcode, e);
            let rsp = GetPlayerTokenRsp {
                retcode: retcode.code(),
                msg: e.to_string(),
                black_uid_end_time: match e {
                    HandshakeError::BlackUid { end_time } => end_time,
                    _ => 0,
                },
                ..Default::default()
            };
            OutboundFrame::new(cmd::GET_PLAYER_TOKEN_RSP, client_seq, rsp.encode_to_vec())
        }
    };
    ctx.send_frame(session, frame).await;
}

async fn run(ctx: &Arc<GateContext>, session: &Arc<Session>, req: &GetPlayerTokenReq) -> Result<Granted, HandshakeError> {
    if req.account_uid.is_empty() {
        return Err(HandshakeError::BadRequest("empty account_uid".to_string()));
    }

    ctx.identity.verify(&req.account_uid, &req.account_token).await?;

    let guard = LoginLockGuard::acquire(Arc::clone(&ctx.login_lock), &req.account_uid, ctx.config.login_lock_ttl)
        .await?
        .ok_or_else(|| HandshakeError::AnotherLogin(req.account_uid.clone()))?;
    let result = run_locked(ctx, session, req).await;
    guard.release().await;
    result
}

async fn run_locked(
    ctx: &Arc<GateContext>,
    session: &Arc<Session>,
    req: &GetPlayerTokenReq,
) -> Result<Granted, HandshakeError> {
    let account = resolve_account(ctx, &req.account_uid).await?;
    if let Some(end_time) = account.ban_end(unix_now()) {
        return Err(HandshakeError::BlackUid { end_time });
    }
    let uid = account.uid;

    if ctx.cache.is_stopped_for(&session.peer_ip(), unix_now()) {
        return Err(HandshakeError::StopServer);
    }
    if ctx.registry.bound_count() >= ctx.config.max_sessions {
        return Err(HandshakeError::MaxPlayer);
    }

    evict_previous(ctx, uid).await?;

    let workers = ctx.cache.workers();
    let game_worker = workers.game.ok_or(HandshakeError::NoGameWorker)?;

    let (keys, keystream) = exchange_keys(ctx, req)?;

    if !ctx.registry.bind_uid(uid, session) {
        return Err(HandshakeError::AnotherLogin(req.account_uid.clone()));
    }
    session.set_uid(uid);
    session.set_account_uid(&req.account_uid);
    session.set_game_worker(Some(game_worker));
    session.set_path_worker(workers.path);
    ctx.registry.apply_presence(uid, ctx.gate_id, true);

    if !session.advance(SessionState::Established, SessionState::AwaitingLogin) {
        // Closed while the checks ran; its close did not see the binding
        ctx.registry.remove_session(session);
        ctx.registry.apply_presence(uid, ctx.gate_id, false);
        return Err(HandshakeError::BadRequest("session closed during login".to_string()));
    }
    ctx.publish(GATE_BROADCAST, &Envelope::presence_change(uid, ctx.gate_id, true))
        .await;
    debug!(
        "uid {} bound to game worker {} path worker {:?}",
        uid, game_worker, workers.path
    );

    let rsp = GetPlayerTokenRsp {
        retcode: Retcode::Succ.code(),
        uid,
        token: req.account_token.clone(),
        account_type: ACCOUNT_TYPE,
        account_uid: req.account_uid.clone(),
        channel_id: CHANNEL_ID,
        platform_type: PLATFORM_TYPE,
        client_ip_str: session.peer_ip(),
        security_cmd_buffer: random_bytes(SECURITY_CMD_BUFFER_LEN),
        client_version_random_key: random_cookie(),
        secret_key_seed: keys.secret_key_seed,
        secret_key: keys.secret_key,
        key_id: keys.key_id,
        server_rand_key: keys.server_rand_key,
        sign: keys.sign,
        ..Default::default()
    };
    Ok(Granted { rsp, keystream })
}

async fn resolve_account(ctx: &GateContext, account_uid: &str) -> Result<Account, HandshakeError> {
    if let Some(account) = ctx.accounts.find(account_uid).await? {
        return Ok(account);
    }
    let uid = ctx.control_plane.get_next_uid().await?;
    let account = Account::new(account_uid, uid);
    ctx.accounts.insert(&account).await?;
    info!("Allocated uid {} for account {}", uid, account_uid);
    Ok(account)
}

/// Makes sure no other session holds `uid` anywhere in the fleet
async fn evict_previous(ctx: &GateContext, uid: u32) -> Result<(), HandshakeError> {
    let remote = ctx.registry.fleet_owner(uid).filter(|gate| *gate != ctx.gate_id);
    if ctx.registry.get_by_uid(uid).is_none() && remote.is_none() {
        return Ok(());
    }

    // Registered before the kick so the offline event cannot be missed
    let waiter = ctx.registry.register_kick_waiter(uid);

    if let Some(previous) = ctx.registry.get_by_uid(uid) {
        info!("uid {} logged in again, closing session {}", uid, previous.id());
        ctx.close_session(&previous, CloseReason::ServerRelogin).await;
    } else if let Some(owner) = remote {
        info!("uid {} is online on gate {}, asking it to kick", uid, owner);
        let kick = Envelope::kick_player(uid, CloseReason::ServerRelogin, ctx.gate_id);
        let published = tokio::time::timeout(
            ctx.config.kick_register_timeout,
            ctx.bus.publish(GATE_BROADCAST, &kick),
        )
        .await;
        match published {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                ctx.registry.cancel_kick_waiter(uid);
                return Err(e.into());
            }
            Err(_) => {
                ctx.registry.cancel_kick_waiter(uid);
                return Err(HandshakeError::KickTimeout(uid));
            }
        }
    } else {
        ctx.registry.cancel_kick_waiter(uid);
        return Ok(());
    }

    match tokio::time::timeout(ctx.config.kick_wait_timeout, waiter).await {
        Ok(Ok(())) => Ok(()),
        _ => {
            ctx.registry.cancel_kick_waiter(uid);
            Err(HandshakeError::KickTimeout(uid))
        }
    }
}

fn exchange_keys(ctx: &GateContext, req: &GetPlayerTokenReq) -> Result<(KeyFields, Keystream), HandshakeError> {
    let server_seed = time_seed();

    if req.key_id == 0 {
        let keys = KeyFields {
            secret_key_seed: server_seed,
            secret_key: random_cookie(),
            ..Default::default()
        };
        return Ok((keys, Keystream::derive(server_seed, SeedMode::Normal)));
    }

    let keyring = ctx
        .keyring
        .as_ref()
        .filter(|keyring| keyring.has_key(req.key_id))
        .ok_or(HandshakeError::UnknownKeyId(req.key_id))?;
    let client_seed = keyring.decrypt_client_seed(req.key_id, &req.client_rand_key)?;
    let combined = client_seed ^ server_seed;
    let (server_rand_key, sign) = keyring.seal_seed(req.key_id, combined)?;

    let keys = KeyFields {
        key_id: req.key_id,
        server_rand_key,
        sign,
        ..Default::default()
    };
    Ok((keys, Keystream::derive(combined, SeedMode::Magic)))
}
