use clap::Parser;
use gate::config::{GateArgs, GateConfig};
use gate::context::GateServices;
use gate::GateServer;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

/// Parses arguments, wires the external services and serves until a
/// shutdown signal arrives.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = GateConfig::from_args(GateArgs::parse())?;
    info!("Starting gate on {}", config.listen_addr());

    let services = if config.standalone_mode_enable {
        info!("Standalone mode: bus, discovery and stores run in-process");
        GateServices::standalone()
    } else {
        GateServices::connect(&config).await?
    };
    let standalone = config.standalone_mode_enable;

    let server = GateServer::new(config, services).await?;
    info!(
        "Listening on udp {} tcp {:?}",
        server.local_udp_addr(),
        server.local_tcp_addr()
    );

    let shutdown = server.context().shutdown.clone();
    tokio::spawn(wait_for_signal(shutdown, standalone));

    server.run().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal(shutdown: CancellationToken, standalone: bool) {
    use tokio::signal::unix::{signal, SignalKind};

    if standalone {
        ctrl_c(shutdown).await;
        return;
    }

    let (mut hup, mut int, mut term, mut quit) = match (
        signal(SignalKind::hangup()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) {
        (Ok(hup), Ok(int), Ok(term), Ok(quit)) => (hup, int, term, quit),
        _ => {
            warn!("Could not install signal handlers, falling back to Ctrl+C");
            ctrl_c(shutdown).await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hup.recv() => {
                info!("Ignoring SIGHUP");
                continue;
            }
            _ = int.recv() => info!("Received SIGINT"),
            _ = term.recv() => info!("Received SIGTERM"),
            _ = quit.recv() => info!("Received SIGQUIT"),
        }
        break;
    }
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn wait_for_signal(shutdown: CancellationToken, _standalone: bool) {
    ctrl_c(shutdown).await;
}

async fn ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => {
            warn!("Ctrl+C handler failed: {}", e);
            return;
        }
    }
    shutdown.cancel();
}
