use clap::Parser;
use client::{Credentials, GateClient, SeedKeys};
use log::{info, warn};
use shared::{ByteCheckMode, Keystream, Retcode, SeedMode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe client for the edge gateway", long_about = None)]
struct Args {
    /// Gate address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:22102")]
    server: SocketAddr,

    /// Use length-prefixed TCP instead of reliable UDP
    #[arg(long)]
    tcp: bool,

    /// Integrity trailer on UDP datagrams: 0 none, 1 CRC32, 2 FNV-1a
    #[arg(long, default_value = "0")]
    byte_check_mode: u8,

    /// Seed of the gate's dispatch keystream
    #[arg(long, default_value = "2246800662264969608")]
    dispatch_seed: u64,

    #[arg(short = 'u', long, default_value = "probe")]
    account_uid: String,

    #[arg(short = 't', long, default_value = "probe-token")]
    account_token: String,

    /// RSA key id; 0 uses the plain seed exchange
    #[arg(long, default_value = "0")]
    key_id: u32,

    /// PEM private key of --key-id
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// PEM public key used to check the gate's seed signature
    #[arg(long)]
    signing_key: Option<PathBuf>,

    /// Pings to send after logging in
    #[arg(short = 'p', long, default_value = "3")]
    pings: u32,

    /// Seconds to wait for each answer
    #[arg(long, default_value = "5")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let timeout = Duration::from_secs(args.timeout);
    let dispatch = Keystream::derive(args.dispatch_seed, SeedMode::Normal);

    let keys = match (args.key_id, &args.key_file) {
        (0, _) => None,
        (key_id, Some(path)) => Some(SeedKeys::load(key_id, path, args.signing_key.as_deref())?),
        (key_id, None) => return Err(format!("--key-id {} needs --key-file", key_id).into()),
    };

    let mut client = if args.tcp {
        GateClient::connect_tcp(args.server, dispatch).await?
    } else {
        let byte_check = ByteCheckMode::from_code(args.byte_check_mode)
            .ok_or_else(|| format!("unknown byte check mode {}", args.byte_check_mode))?;
        GateClient::connect_udp(args.server, byte_check, dispatch).await?
    };

    let credentials = Credentials {
        account_uid: args.account_uid,
        account_token: args.account_token,
        platform_type: 3,
        channel_id: 1,
    };
    let rsp = client.request_token(&credentials, keys.as_ref(), timeout).await?;
    if rsp.retcode != Retcode::Succ.code() {
        warn!("Gate refused the token request: retcode {} {}", rsp.retcode, rsp.msg);
        client.close().await;
        return Ok(());
    }
    info!("Token accepted, uid {}", rsp.uid);

    match client.login(&rsp.token, rsp.uid, timeout).await {
        Ok(login) => info!("Login answered with retcode {}", login.retcode),
        Err(e) => {
            warn!("Login failed: {}", e);
            client.close().await;
            return Ok(());
        }
    }

    for seq in 1..=args.pings {
        client.ping(seq).await?;
        match client.recv_cmd(shared::proto::cmd::PING_RSP, timeout).await {
            Ok(_) => info!("Ping {} answered", seq),
            Err(e) => warn!("Ping {} unanswered: {}", seq, e),
        }
    }

    client.close().await;
    Ok(())
}
