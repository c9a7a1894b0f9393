//! Command-line and environment configuration
//!
//! [`GateArgs`] is the raw clap surface; every flag can also be set through a
//! `GATE_*` environment variable. [`GateConfig`] is the validated value the
//! rest of the gateway reads, and it also carries the fixed budgets and
//! timeouts of the session layer.

use crate::error::GateError;
use clap::Parser;
use shared::ByteCheckMode;
use std::path::PathBuf;
use std::time::Duration;

/// New connections accepted per second, process-wide
pub const CONNECT_RATE_PER_SEC: u32 = 100;
/// Frames a session may receive per second
pub const RECV_RATE_PER_SEC: u32 = 1000;
/// Frames a session may send per second
pub const SEND_RATE_PER_SEC: u32 = 1000;
/// Bound of the per-session outbound queue
pub const SEND_QUEUE_LEN: usize = 1000;

pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const TCP_ECHO_INTERVAL: Duration = Duration::from_secs(5);

pub const LOGIN_LOCK_TTL: Duration = Duration::from_secs(10);
pub const KICK_REGISTER_TIMEOUT: Duration = Duration::from_secs(1);
pub const KICK_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub const PRESENCE_SYNC_INTERVAL: Duration = Duration::from_secs(60);
pub const WORKER_SYNC_INTERVAL: Duration = Duration::from_secs(15);
pub const STOP_WINDOW_SYNC_INTERVAL: Duration = Duration::from_secs(60);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Edge gateway for reliable-UDP game sessions", long_about = None)]
pub struct GateArgs {
    /// Address to bind the listeners to
    #[arg(long, env = "GATE_KCP_ADDR", default_value = "0.0.0.0")]
    pub kcp_addr: String,

    /// Port for the reliable-UDP listener (and TCP when enabled)
    #[arg(long, env = "GATE_KCP_PORT", default_value = "22102")]
    pub kcp_port: u16,

    /// Also accept length-prefixed TCP sessions on the same port
    #[arg(long, env = "GATE_TCP_MODE_ENABLE")]
    pub tcp_mode_enable: bool,

    /// Integrity trailer on UDP datagrams: 0 none, 1 CRC32, 2 FNV-1a
    #[arg(long, env = "GATE_BYTE_CHECK_MODE", default_value = "0")]
    pub byte_check_mode: u8,

    /// Remap client cmd ids through the table in --client-cmd-map
    #[arg(long, env = "GATE_CLIENT_PROTO_PROXY_ENABLE")]
    pub client_proto_proxy_enable: bool,

    /// CSV table of `name,client_cmd_id,server_cmd_id`
    #[arg(long, env = "GATE_CLIENT_CMD_MAP")]
    pub client_cmd_map: Option<PathBuf>,

    /// Identity service endpoint; an empty value accepts every credential
    #[arg(long, env = "GATE_LOGIN_SDK_URL", default_value = "")]
    pub login_sdk_url: String,

    /// HMAC secret shared with the identity service
    #[arg(long, env = "GATE_LOGIN_SDK_ACCOUNT_KEY", default_value = "")]
    pub login_sdk_account_key: String,

    /// Directory holding `{key_id}.pem` key pairs and `signing.pem`
    #[arg(long, env = "GATE_RSA_KEYS")]
    pub rsa_keys: Option<PathBuf>,

    /// Run bus, discovery, lock and account store in-process
    #[arg(long, env = "GATE_STANDALONE_MODE_ENABLE")]
    pub standalone_mode_enable: bool,

    /// Message bus URL
    #[arg(long, env = "GATE_MQ_URL", default_value = "nats://127.0.0.1:4222")]
    pub mq_url: String,

    /// Key-value store URL
    #[arg(long, env = "GATE_KV_URL", default_value = "redis://127.0.0.1:6379")]
    pub kv_url: String,

    /// Concurrent logged-in sessions allowed on this gateway
    #[arg(long, env = "GATE_MAX_SESSIONS", default_value = "1000")]
    pub max_sessions: usize,

    /// Client version used for the discovery self-check
    #[arg(long, env = "GATE_GAME_VERSION", default_value = "OSRELWin0.0.0")]
    pub game_version: String,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub kcp_addr: String,
    pub kcp_port: u16,
    pub tcp_mode_enable: bool,
    pub byte_check_mode: ByteCheckMode,
    pub client_proto_proxy_enable: bool,
    pub client_cmd_map: Option<PathBuf>,
    pub login_sdk_url: String,
    pub login_sdk_account_key: String,
    pub rsa_keys: Option<PathBuf>,
    pub standalone_mode_enable: bool,
    pub mq_url: String,
    pub kv_url: String,
    pub max_sessions: usize,
    pub game_version: String,

    pub read_idle_timeout: Duration,
    pub write_timeout: Duration,
    pub kick_register_timeout: Duration,
    pub kick_wait_timeout: Duration,
    pub login_lock_ttl: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            kcp_addr: "0.0.0.0".to_string(),
            kcp_port: 22102,
            tcp_mode_enable: false,
            byte_check_mode: ByteCheckMode::None,
            client_proto_proxy_enable: false,
            client_cmd_map: None,
            login_sdk_url: String::new(),
            login_sdk_account_key: String::new(),
            rsa_keys: None,
            standalone_mode_enable: true,
            mq_url: String::new(),
            kv_url: String::new(),
            max_sessions: 1000,
            game_version: String::new(),
            read_idle_timeout: READ_IDLE_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            kick_register_timeout: KICK_REGISTER_TIMEOUT,
            kick_wait_timeout: KICK_WAIT_TIMEOUT,
            login_lock_ttl: LOGIN_LOCK_TTL,
        }
    }
}

impl GateConfig {
    pub fn from_args(args: GateArgs) -> Result<Self, GateError> {
        let byte_check_mode = ByteCheckMode::from_code(args.byte_check_mode).ok_or_else(|| {
            GateError::Config(format!("unknown byte check mode {}", args.byte_check_mode))
        })?;

        if args.client_proto_proxy_enable && args.client_cmd_map.is_none() {
            return Err(GateError::Config(
                "--client-proto-proxy-enable needs --client-cmd-map".to_string(),
            ));
        }
        if args.max_sessions == 0 {
            return Err(GateError::Config("--max-sessions must be positive".to_string()));
        }

        Ok(Self {
            kcp_addr: args.kcp_addr,
            kcp_port: args.kcp_port,
            tcp_mode_enable: args.tcp_mode_enable,
            byte_check_mode,
            client_proto_proxy_enable: args.client_proto_proxy_enable,
            client_cmd_map: args.client_cmd_map,
            login_sdk_url: args.login_sdk_url,
            login_sdk_account_key: args.login_sdk_account_key,
            rsa_keys: args.rsa_keys,
            standalone_mode_enable: args.standalone_mode_enable,
            mq_url: args.mq_url,
            kv_url: args.kv_url,
            max_sessions: args.max_sessions,
            game_version: args.game_version,
            ..Self::default()
        })
    }

    /// Loopback config on ephemeral ports, used by tests and local runs
    pub fn loopback() -> Self {
        Self {
            kcp_addr: "127.0.0.1".to_string(),
            kcp_port: 0,
            tcp_mode_enable: true,
            ..Self::default()
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.kcp_addr, self.kcp_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> GateArgs {
        let mut argv = vec!["gate"];
        argv.extend_from_slice(args);
        GateArgs::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let config = GateConfig::from_args(parse(&[])).unwrap();
        assert_eq!(config.kcp_port, 22102);
        assert_eq!(config.max_sessions, 1000);
        assert_eq!(config.byte_check_mode, ByteCheckMode::None);
        assert!(!config.tcp_mode_enable);
        assert_eq!(config.kick_wait_timeout, KICK_WAIT_TIMEOUT);
        assert_eq!(config.listen_addr(), "0.0.0.0:22102");
    }

    #[test]
    fn test_flags() {
        let config = GateConfig::from_args(parse(&[
            "--kcp-port",
            "23000",
            "--tcp-mode-enable",
            "--byte-check-mode",
            "2",
            "--standalone-mode-enable",
        ]))
        .unwrap();
        assert_eq!(config.kcp_port, 23000);
        assert!(config.tcp_mode_enable);
        assert!(config.standalone_mode_enable);
        assert_eq!(config.byte_check_mode, ByteCheckMode::Fnv1a);
    }

    #[test]
    fn test_invalid_byte_check_mode() {
        let err = GateConfig::from_args(parse(&["--byte-check-mode", "7"])).unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }

    #[test]
    fn test_proxy_needs_table() {
        let err = GateConfig::from_args(parse(&["--client-proto-proxy-enable"])).unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }

    #[test]
    fn test_loopback() {
        let config = GateConfig::loopback();
        assert_eq!(config.listen_addr(), "127.0.0.1:0");
        assert!(config.tcp_mode_enable);
    }
}
