//! Gateway lifecycle
//!
//! [`GateServer::new`] binds the listeners, registers with discovery and
//! loads every snapshot; any failure there is fatal. [`GateServer::run`]
//! serves until the shutdown token fires, then closes every session with
//! "server-shutdown", deregisters and lets the forwarding task drain.

use crate::cmd_proxy::CmdProxy;
use crate::config::{GateConfig, CONNECT_RATE_PER_SEC};
use crate::context::{GateContext, GateServices};
use crate::control_plane::{initial_sync, spawn_sync_tasks, GateServerAddr, ServerType};
use crate::crypto::RsaKeyring;
use crate::error::GateError;
use crate::rate_limit::{RateLimiter, SharedRateLimiter};
use crate::router;
use crate::session;
use crate::transport::tcp::TcpListener;
use crate::transport::udp::UdpListener;
use crate::transport::Link;
use log::{debug, info, warn};
use shared::{CloseReason, Keystream, SeedMode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ACCEPT_QUEUE_LEN: usize = 256;

pub struct GateServer {
    ctx: Arc<GateContext>,
    udp: UdpListener,
    tcp: Option<TcpListener>,
    udp_addr: SocketAddr,
    tcp_addr: Option<SocketAddr>,
    /// Connection budget spent by both listeners
    connect_limit: SharedRateLimiter,
}

impl GateServer {
    pub async fn new(config: GateConfig, services: GateServices) -> Result<Self, GateError> {
        let udp = UdpListener::bind(&config.listen_addr(), config.byte_check_mode).await?;
        let udp_addr = udp.local_addr()?;

        // TCP shares the UDP port, which matters when the port was ephemeral
        let tcp = if config.tcp_mode_enable {
            let addr = format!("{}:{}", config.kcp_addr, udp_addr.port());
            Some(TcpListener::bind(&addr, config.write_timeout).await?)
        } else {
            None
        };
        let tcp_addr = tcp.as_ref().map(|t| t.local_addr()).transpose()?;

        let advertised = GateServerAddr {
            kcp_addr: config.kcp_addr.clone(),
            kcp_port: udp_addr.port(),
        };
        let gate_id = services
            .control_plane
            .register_server(ServerType::Gate, advertised.clone())
            .await?;
        info!("Registered as gate {} at {}", gate_id, udp_addr);

        match services.control_plane.get_gate_server_addr(&config.game_version).await {
            Ok(found) if found == advertised => debug!("Discovery returns this gate for {}", config.game_version),
            Ok(found) => warn!(
                "Discovery returns {}:{} for {}, not this gate",
                found.kcp_addr, found.kcp_port, config.game_version
            ),
            Err(e) => warn!("Gate address self-check failed: {}", e),
        }

        let region_seed = services.control_plane.get_region_ec2b().await?;
        let dispatch_keystream = Keystream::derive(region_seed, SeedMode::Normal);

        let keyring = config
            .rsa_keys
            .as_deref()
            .map(RsaKeyring::load_dir)
            .transpose()?;
        if keyring.is_none() {
            info!("No RSA keys configured, only key id 0 handshakes are accepted");
        }

        let cmd_proxy = if config.client_proto_proxy_enable {
            let proxy = config.client_cmd_map.as_deref().map(CmdProxy::load).transpose()?;
            if let Some(proxy) = &proxy {
                info!("Loaded {} client cmd mappings", proxy.len());
            }
            proxy
        } else {
            None
        };

        let ctx = Arc::new(GateContext::new(config, gate_id, services, dispatch_keystream, keyring, cmd_proxy));
        initial_sync(&ctx).await?;

        Ok(Self {
            ctx,
            udp,
            tcp,
            udp_addr,
            tcp_addr,
            connect_limit: SharedRateLimiter::new(RateLimiter::per_second(CONNECT_RATE_PER_SEC)),
        })
    }

    pub fn local_udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn context(&self) -> &Arc<GateContext> {
        &self.ctx
    }

    /// Serves until `context().shutdown` is cancelled
    pub async fn run(self) -> Result<(), GateError> {
        let Self {
            ctx,
            udp,
            tcp,
            connect_limit,
            ..
        } = self;
        let (accept_tx, mut accept_rx) = mpsc::channel::<Link>(ACCEPT_QUEUE_LEN);

        let mut tasks = vec![tokio::spawn(udp.run(
            accept_tx.clone(),
            connect_limit.clone(),
            ctx.shutdown.clone(),
        ))];
        if let Some(tcp) = tcp {
            tasks.push(tokio::spawn(tcp.run(accept_tx.clone(), connect_limit, ctx.shutdown.clone())));
        }
        drop(accept_tx);

        let drained = CancellationToken::new();
        let forwarding = router::spawn_forwarding(&ctx, drained.clone()).await?;
        tasks.extend(spawn_sync_tasks(&ctx));
        info!("Gate {} is serving", ctx.gate_id);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                link = accept_rx.recv() => match link {
                    Some(link) => {
                        session::spawn(&ctx, link);
                    }
                    None => break,
                },
            }
        }

        info!("Gate {} shutting down with {} sessions", ctx.gate_id, ctx.registry.session_count());
        // Listeners and sync tasks stop; forwarding keeps serving while sessions close
        ctx.shutdown.cancel();
        ctx.close_all(CloseReason::ServerShutdown).await;
        if let Err(e) = ctx.control_plane.cancel_server(ctx.gate_id).await {
            warn!("Failed to deregister gate {}: {}", ctx.gate_id, e);
        }

        drained.cancel();
        if let Err(e) = forwarding.await {
            warn!("Forwarding task ended abnormally: {}", e);
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("Gate {} stopped", ctx.gate_id);
        Ok(())
    }
}
