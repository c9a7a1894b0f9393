//! Process-wide state shared by every task
//!
//! [`GateServices`] bundles the external collaborators (bus, discovery,
//! identity, login lock, account store) so tests and standalone mode can
//! swap in in-process versions. [`GateContext`] adds the registry, caches,
//! key material and the shutdown token.

use crate::accounts::{AccountStore, MemoryAccountStore, RedisAccountStore};
use crate::bus::{LocalBus, MessageBus, NatsBus};
use crate::cmd_proxy::CmdProxy;
use crate::config::GateConfig;
use crate::control_plane::{BusControlPlane, ControlPlane, ControlPlaneCache, LocalControlPlane};
use crate::crypto::RsaKeyring;
use crate::error::GateError;
use crate::identity::{HttpIdentityVerifier, IdentityVerifier, LocalIdentityVerifier};
use crate::login_lock::{LoginLock, MemoryLoginLock, RedisLoginLock};
use crate::registry::Registry;
use crate::session::{OutboundFrame, Session};
use log::{info, warn};
use shared::envelope::{game_topic, GATE_BROADCAST};
use shared::{CloseReason, Envelope, Keystream};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct GateServices {
    pub bus: Arc<dyn MessageBus>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub login_lock: Arc<dyn LoginLock>,
    pub accounts: Arc<dyn AccountStore>,
}

impl GateServices {
    /// Everything in-process
    pub fn standalone() -> Self {
        Self {
            bus: Arc::new(LocalBus::new()),
            control_plane: Arc::new(LocalControlPlane::default()),
            identity: Arc::new(LocalIdentityVerifier::new()),
            login_lock: Arc::new(MemoryLoginLock::new()),
            accounts: Arc::new(MemoryAccountStore::new()),
        }
    }

    /// Connects to NATS and Redis; identity goes over HTTP when a URL is set
    pub async fn connect(config: &GateConfig) -> Result<Self, GateError> {
        let nats = NatsBus::connect(&config.mq_url).await?;
        let control_plane = Arc::new(BusControlPlane::new(nats.client()));

        let redis = redis::Client::open(config.kv_url.as_str())?;
        info!("Using key-value store at {}", config.kv_url);

        let identity: Arc<dyn IdentityVerifier> = if config.login_sdk_url.is_empty() {
            warn!("No identity service configured, accepting every credential");
            Arc::new(LocalIdentityVerifier::new())
        } else {
            Arc::new(HttpIdentityVerifier::new(&config.login_sdk_url, &config.login_sdk_account_key)?)
        };

        Ok(Self {
            bus: Arc::new(nats),
            control_plane,
            identity,
            login_lock: Arc::new(RedisLoginLock::new(redis.clone())),
            accounts: Arc::new(RedisAccountStore::new(redis)),
        })
    }
}

pub struct GateContext {
    pub config: GateConfig,
    pub gate_id: u32,
    pub registry: Registry,
    pub cache: ControlPlaneCache,
    pub bus: Arc<dyn MessageBus>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub login_lock: Arc<dyn LoginLock>,
    pub accounts: Arc<dyn AccountStore>,
    pub keyring: Option<RsaKeyring>,
    pub cmd_proxy: Option<CmdProxy>,
    dispatch_keystream: RwLock<Arc<Keystream>>,
    pub shutdown: CancellationToken,
}

impl GateContext {
    pub fn new(
        config: GateConfig,
        gate_id: u32,
        services: GateServices,
        dispatch_keystream: Keystream,
        keyring: Option<RsaKeyring>,
        cmd_proxy: Option<CmdProxy>,
    ) -> Self {
        Self {
            config,
            gate_id,
            registry: Registry::new(),
            cache: ControlPlaneCache::default(),
            bus: services.bus,
            control_plane: services.control_plane,
            identity: services.identity,
            login_lock: services.login_lock,
            accounts: services.accounts,
            keyring,
            cmd_proxy,
            dispatch_keystream: RwLock::new(Arc::new(dispatch_keystream)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Keystream every new session starts with
    pub fn dispatch_keystream(&self) -> Arc<Keystream> {
        Arc::clone(&self.dispatch_keystream.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub async fn publish(&self, topic: &str, envelope: &Envelope) {
        if let Err(e) = self.bus.publish(topic, envelope).await {
            warn!("Publish on {} failed: {}", topic, e);
        }
    }

    /// Queues a frame for `session`, closing it when the queue is saturated
    pub async fn send_frame(&self, session: &Arc<Session>, frame: OutboundFrame) {
        match session.try_enqueue(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Session {} (uid {}) send queue saturated", session.id(), session.uid());
                self.close_session(session, CloseReason::WaitSendMax).await;
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Closes `session` once; concurrent callers after the first do nothing
    pub async fn close_session(&self, session: &Arc<Session>, reason: CloseReason) {
        if !session.begin_close() {
            return;
        }
        self.registry.remove_session(session);

        let uid = session.uid();
        if uid != 0 {
            self.registry.apply_presence(uid, self.gate_id, false);
            self.registry.fulfil_kick_waiter(uid);
            if let Some(worker) = session.game_worker() {
                self.publish(&game_topic(worker), &Envelope::user_offline(uid, reason, self.gate_id))
                    .await;
            }
            self.publish(GATE_BROADCAST, &Envelope::presence_change(uid, self.gate_id, false))
                .await;
        }

        session.close_transport(reason);
        info!("Session {} (uid {}) closed: {}", session.id(), uid, reason);
    }

    /// Closes every session, used on shutdown
    pub async fn close_all(&self, reason: CloseReason) {
        for session in self.registry.all_sessions() {
            self.close_session(&session, reason).await;
        }
    }
}
