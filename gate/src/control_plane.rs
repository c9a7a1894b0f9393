//! Discovery client and the process-wide snapshots it keeps fresh
//!
//! ### RPCs
//! [`ControlPlane`] is the discovery surface the gateway consumes. Two
//! implementations exist: [`BusControlPlane`] sends each call as a NATS
//! request on `discovery.{method}` with bincode bodies, and
//! [`LocalControlPlane`] answers in-process for standalone mode and tests.
//!
//! ### Snapshots
//! [`ControlPlaneCache`] holds the least-loaded worker binding, the stop-server
//! window and the IP allow-list. The `sync_*` functions refresh one snapshot
//! each; [`spawn_sync_tasks`] runs them on their intervals. A failed refresh
//! keeps serving the previous snapshot.

use crate::config::{
    KEEPALIVE_INTERVAL, PRESENCE_SYNC_INTERVAL, RPC_TIMEOUT, STOP_WINDOW_SYNC_INTERVAL,
    WORKER_SYNC_INTERVAL,
};
use crate::context::GateContext;
use crate::error::GateError;
use crate::registry::Registry;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerType {
    Gate,
    Game,
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateServerAddr {
    pub kcp_addr: String,
    pub kcp_port: u16,
}

/// Maintenance window in Unix seconds; inactive when `end <= start`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopServerInfo {
    pub start_time: u32,
    pub end_time: u32,
}

impl StopServerInfo {
    pub fn contains(&self, now: u32) -> bool {
        self.start_time < self.end_time && now >= self.start_time && now <= self.end_time
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_gate_server_addr(&self, game_version: &str) -> Result<GateServerAddr, GateError>;
    /// Least-loaded worker of a type, if any is registered
    async fn get_server_app_id(&self, server_type: ServerType) -> Result<Option<u32>, GateError>;
    async fn get_global_gs_online_map(&self) -> Result<HashMap<u32, u32>, GateError>;
    async fn get_stop_server_info(&self) -> Result<StopServerInfo, GateError>;
    async fn get_white_list(&self) -> Result<Vec<String>, GateError>;
    async fn get_next_uid(&self) -> Result<u32, GateError>;
    /// Seed of the dispatch-level keystream
    async fn get_region_ec2b(&self) -> Result<u64, GateError>;
    async fn register_server(&self, server_type: ServerType, addr: GateServerAddr) -> Result<u32, GateError>;
    async fn keepalive_server(&self, server_id: u32, load: u32) -> Result<(), GateError>;
    async fn cancel_server(&self, server_id: u32) -> Result<(), GateError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisterServerReq {
    server_type: ServerType,
    addr: GateServerAddr,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeepaliveServerReq {
    server_id: u32,
    load: u32,
}

/// Discovery over bus request/reply
pub struct BusControlPlane {
    client: async_nats::Client,
}

impl BusControlPlane {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    async fn call<Req: Serialize + Sync, Rsp: DeserializeOwned>(
        &self,
        method: &str,
        req: &Req,
    ) -> Result<Rsp, GateError> {
        let payload = bincode::serialize(req)?;
        let subject = format!("discovery.{}", method);
        let reply = tokio::time::timeout(RPC_TIMEOUT, self.client.request(subject, payload.into()))
            .await
            .map_err(|_| GateError::ControlPlane(format!("{} timed out", method)))?
            .map_err(|e| GateError::ControlPlane(format!("{}: {}", method, e)))?;
        Ok(bincode::deserialize(&reply.payload)?)
    }
}

#[async_trait]
impl ControlPlane for BusControlPlane {
    async fn get_gate_server_addr(&self, game_version: &str) -> Result<GateServerAddr, GateError> {
        self.call("GetGateServerAddr", &game_version.to_string()).await
    }

    async fn get_server_app_id(&self, server_type: ServerType) -> Result<Option<u32>, GateError> {
        self.call("GetServerAppId", &server_type).await
    }

    async fn get_global_gs_online_map(&self) -> Result<HashMap<u32, u32>, GateError> {
        self.call("GetGlobalGsOnlineMap", &()).await
    }

    async fn get_stop_server_info(&self) -> Result<StopServerInfo, GateError> {
        self.call("GetStopServerInfo", &()).await
    }

    async fn get_white_list(&self) -> Result<Vec<String>, GateError> {
        self.call("GetWhiteList", &()).await
    }

    async fn get_next_uid(&self) -> Result<u32, GateError> {
        self.call("GetNextUid", &()).await
    }

    async fn get_region_ec2b(&self) -> Result<u64, GateError> {
        self.call("GetRegionEc2B", &()).await
    }

    async fn register_server(&self, server_type: ServerType, addr: GateServerAddr) -> Result<u32, GateError> {
        self.call("RegisterServer", &RegisterServerReq { server_type, addr }).await
    }

    async fn keepalive_server(&self, server_id: u32, load: u32) -> Result<(), GateError> {
        self.call("KeepaliveServer", &KeepaliveServerReq { server_id, load }).await
    }

    async fn cancel_server(&self, server_id: u32) -> Result<(), GateError> {
        self.call("CancelServer", &server_id).await
    }
}

#[derive(Debug, Default)]
struct LocalState {
    servers: HashMap<u32, (ServerType, GateServerAddr, u32)>,
    online: HashMap<u32, u32>,
    stop: StopServerInfo,
    white_list: Vec<String>,
}

/// In-process discovery service
pub struct LocalControlPlane {
    state: Mutex<LocalState>,
    next_server_id: AtomicU32,
    next_uid: AtomicU32,
    region_seed: u64,
}

impl Default for LocalControlPlane {
    fn default() -> Self {
        Self::new(0x1F2E_3D4C_5B6A_7988)
    }
}

impl LocalControlPlane {
    pub fn new(region_seed: u64) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            next_server_id: AtomicU32::new(1),
            next_uid: AtomicU32::new(10001),
            region_seed,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a worker without an address, as a worker process would
    pub fn register_worker(&self, server_type: ServerType) -> u32 {
        let id = self.next_server_id.fetch_add(1, Ordering::SeqCst);
        let addr = GateServerAddr {
            kcp_addr: String::new(),
            kcp_port: 0,
        };
        self.lock().servers.insert(id, (server_type, addr, 0));
        id
    }

    pub fn set_online(&self, uid: u32, gate_id: u32) {
        self.lock().online.insert(uid, gate_id);
    }

    pub fn set_offline(&self, uid: u32) {
        self.lock().online.remove(&uid);
    }

    pub fn set_stop_server(&self, stop: StopServerInfo) {
        self.lock().stop = stop;
    }

    pub fn set_white_list(&self, ips: Vec<String>) {
        self.lock().white_list = ips;
    }

    pub fn region_seed(&self) -> u64 {
        self.region_seed
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn get_gate_server_addr(&self, _game_version: &str) -> Result<GateServerAddr, GateError> {
        let state = self.lock();
        state
            .servers
            .values()
            .filter(|(t, _, _)| *t == ServerType::Gate)
            .min_by_key(|(_, _, load)| *load)
            .map(|(_, addr, _)| addr.clone())
            .ok_or_else(|| GateError::ControlPlane("no gate registered".to_string()))
    }

    async fn get_server_app_id(&self, server_type: ServerType) -> Result<Option<u32>, GateError> {
        let state = self.lock();
        Ok(state
            .servers
            .iter()
            .filter(|(_, (t, _, _))| *t == server_type)
            .min_by_key(|(id, (_, _, load))| (*load, **id))
            .map(|(id, _)| *id))
    }

    async fn get_global_gs_online_map(&self) -> Result<HashMap<u32, u32>, GateError> {
        Ok(self.lock().online.clone())
    }

    async fn get_stop_server_info(&self) -> Result<StopServerInfo, GateError> {
        Ok(self.lock().stop)
    }

    async fn get_white_list(&self) -> Result<Vec<String>, GateError> {
        Ok(self.lock().white_list.clone())
    }

    async fn get_next_uid(&self) -> Result<u32, GateError> {
        Ok(self.next_uid.fetch_add(1, Ordering::SeqCst))
    }

    async fn get_region_ec2b(&self) -> Result<u64, GateError> {
        Ok(self.region_seed)
    }

    async fn register_server(&self, server_type: ServerType, addr: GateServerAddr) -> Result<u32, GateError> {
        let id = self.next_server_id.fetch_add(1, Ordering::SeqCst);
        self.lock().servers.insert(id, (server_type, addr, 0));
        Ok(id)
    }

    async fn keepalive_server(&self, server_id: u32, load: u32) -> Result<(), GateError> {
        match self.lock().servers.get_mut(&server_id) {
            Some(entry) => {
                entry.2 = load;
                Ok(())
            }
            None => Err(GateError::ControlPlane(format!("server {} not registered", server_id))),
        }
    }

    async fn cancel_server(&self, server_id: u32) -> Result<(), GateError> {
        let mut state = self.lock();
        state.servers.remove(&server_id);
        state.online.retain(|_, gate| *gate != server_id);
        Ok(())
    }
}

/// Worker ids a new session binds to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerBinding {
    pub game: Option<u32>,
    pub path: Option<u32>,
}

#[derive(Debug, Default)]
pub struct ControlPlaneCache {
    workers: RwLock<WorkerBinding>,
    stop: RwLock<StopServerInfo>,
    allow_list: RwLock<Arc<HashSet<String>>>,
}

impl ControlPlaneCache {
    pub fn workers(&self) -> WorkerBinding {
        *self.workers.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_workers(&self, binding: WorkerBinding) {
        *self.workers.write().unwrap_or_else(|e| e.into_inner()) = binding;
    }

    pub fn stop_window(&self) -> StopServerInfo {
        *self.stop.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_stop_window(&self, stop: StopServerInfo) {
        *self.stop.write().unwrap_or_else(|e| e.into_inner()) = stop;
    }

    pub fn set_allow_list(&self, ips: impl IntoIterator<Item = String>) {
        let list: HashSet<String> = ips.into_iter().collect();
        *self.allow_list.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(list);
    }

    /// True when logins from `ip` are refused at `now`
    pub fn is_stopped_for(&self, ip: &str, now: u32) -> bool {
        if !self.stop_window().contains(now) {
            return false;
        }
        let allow = Arc::clone(&self.allow_list.read().unwrap_or_else(|e| e.into_inner()));
        !allow.contains(ip)
    }
}

pub async fn sync_workers(cp: &dyn ControlPlane, cache: &ControlPlaneCache) -> Result<(), GateError> {
    let game = cp.get_server_app_id(ServerType::Game).await?;
    let path = cp.get_server_app_id(ServerType::Path).await?;
    let binding = WorkerBinding { game, path };
    if binding != cache.workers() {
        info!("Worker binding is now game={:?} path={:?}", game, path);
    }
    cache.set_workers(binding);
    Ok(())
}

pub async fn sync_global_presence(cp: &dyn ControlPlane, registry: &Registry, gate_id: u32) -> Result<(), GateError> {
    let snapshot = cp.get_global_gs_online_map().await?;
    debug!("Fleet presence snapshot has {} entries", snapshot.len());
    registry.replace_fleet(snapshot, gate_id);
    Ok(())
}

pub async fn sync_stop_window(cp: &dyn ControlPlane, cache: &ControlPlaneCache) -> Result<(), GateError> {
    cache.set_stop_window(cp.get_stop_server_info().await?);
    Ok(())
}

pub async fn sync_allow_list(cp: &dyn ControlPlane, cache: &ControlPlaneCache) -> Result<(), GateError> {
    cache.set_allow_list(cp.get_white_list().await?);
    Ok(())
}

/// First refresh of every snapshot; any failure is fatal to startup
pub async fn initial_sync(ctx: &GateContext) -> Result<(), GateError> {
    let cp = ctx.control_plane.as_ref();
    sync_workers(cp, &ctx.cache).await?;
    sync_global_presence(cp, &ctx.registry, ctx.gate_id).await?;
    sync_stop_window(cp, &ctx.cache).await?;
    sync_allow_list(cp, &ctx.cache).await?;
    Ok(())
}

fn spawn_periodic<F, Fut>(ctx: &Arc<GateContext>, name: &'static str, period: Duration, job: F) -> JoinHandle<()>
where
    F: Fn(Arc<GateContext>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), GateError>> + Send,
{
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first tick since it fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = job(Arc::clone(&ctx)).await {
                        warn!("{} failed, keeping previous snapshot: {}", name, e);
                    }
                }
            }
        }
        debug!("{} task stopped", name);
    })
}

/// Periodic refresh of every snapshot plus the discovery keepalive
pub fn spawn_sync_tasks(ctx: &Arc<GateContext>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_periodic(ctx, "syncGlobalPresence", PRESENCE_SYNC_INTERVAL, |ctx| async move {
            sync_global_presence(ctx.control_plane.as_ref(), &ctx.registry, ctx.gate_id).await
        }),
        spawn_periodic(ctx, "syncWorkers", WORKER_SYNC_INTERVAL, |ctx| async move {
            sync_workers(ctx.control_plane.as_ref(), &ctx.cache).await
        }),
        spawn_periodic(ctx, "syncStopWindow", STOP_WINDOW_SYNC_INTERVAL, |ctx| async move {
            sync_stop_window(ctx.control_plane.as_ref(), &ctx.cache).await
        }),
        spawn_periodic(ctx, "syncAllowList", STOP_WINDOW_SYNC_INTERVAL, |ctx| async move {
            sync_allow_list(ctx.control_plane.as_ref(), &ctx.cache).await
        }),
        spawn_periodic(ctx, "keepaliveServer", KEEPALIVE_INTERVAL, |ctx| async move {
            let load = ctx.registry.session_count() as u32;
            ctx.control_plane.keepalive_server(ctx.gate_id, load).await
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_window_bounds() {
        let stop = StopServerInfo {
            start_time: 100,
            end_time: 200,
        };
        assert!(!stop.contains(99));
        assert!(stop.contains(100));
        assert!(stop.contains(200));
        assert!(!stop.contains(201));
        assert!(!StopServerInfo::default().contains(0));
    }

    #[test]
    fn test_allow_list_bypasses_window() {
        let cache = ControlPlaneCache::default();
        cache.set_stop_window(StopServerInfo {
            start_time: 0,
            end_time: u32::MAX,
        });
        cache.set_allow_list(vec!["10.0.0.1".to_string()]);
        assert!(!cache.is_stopped_for("10.0.0.1", 50));
        assert!(cache.is_stopped_for("10.0.0.2", 50));
    }

    #[tokio::test]
    async fn test_least_loaded_worker() {
        let cp = LocalControlPlane::default();
        assert_eq!(cp.get_server_app_id(ServerType::Game).await.unwrap(), None);

        let a = cp.register_worker(ServerType::Game);
        let b = cp.register_worker(ServerType::Game);
        cp.keepalive_server(a, 10).await.unwrap();
        cp.keepalive_server(b, 3).await.unwrap();
        assert_eq!(cp.get_server_app_id(ServerType::Game).await.unwrap(), Some(b));
        assert_eq!(cp.get_server_app_id(ServerType::Path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sync_workers_updates_cache() {
        let cp = LocalControlPlane::default();
        let game = cp.register_worker(ServerType::Game);
        let path = cp.register_worker(ServerType::Path);
        let cache = ControlPlaneCache::default();

        sync_workers(&cp, &cache).await.unwrap();
        assert_eq!(
            cache.workers(),
            WorkerBinding {
                game: Some(game),
                path: Some(path)
            }
        );
    }

    #[tokio::test]
    async fn test_uid_allocator_starts_at_10001() {
        let cp = LocalControlPlane::default();
        assert_eq!(cp.get_next_uid().await.unwrap(), 10001);
        assert_eq!(cp.get_next_uid().await.unwrap(), 10002);
    }

    #[tokio::test]
    async fn test_register_and_cancel_gate() {
        let cp = LocalControlPlane::default();
        let addr = GateServerAddr {
            kcp_addr: "127.0.0.1".to_string(),
            kcp_port: 22102,
        };
        let id = cp.register_server(ServerType::Gate, addr.clone()).await.unwrap();
        assert_eq!(cp.get_gate_server_addr("any").await.unwrap(), addr);

        cp.set_online(10001, id);
        cp.cancel_server(id).await.unwrap();
        assert!(cp.get_gate_server_addr("any").await.is_err());
        assert!(cp.get_global_gs_online_map().await.unwrap().is_empty());
        assert!(cp.keepalive_server(id, 0).await.is_err());
    }

    #[test]
    fn test_rpc_bodies_encode() {
        let req = RegisterServerReq {
            server_type: ServerType::Gate,
            addr: GateServerAddr {
                kcp_addr: "0.0.0.0".to_string(),
                kcp_port: 22102,
            },
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: RegisterServerReq = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.server_type, ServerType::Gate);
        assert_eq!(back.addr.kcp_port, 22102);
    }
}
