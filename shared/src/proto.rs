//! Protobuf messages the gateway itself reads or writes
//!
//! Application bodies are opaque to the gateway. The only schemas it needs
//! are the frame head, the two handshake messages, and the few messages whose
//! cmd id alone is not enough to route them (the login response carries the
//! retcode that activates a session).

use prost::Message;

/// Command ids the gateway routes on
pub mod cmd {
    pub const PING_REQ: u16 = 7;
    pub const PING_RSP: u16 = 21;
    pub const PLAYER_LOGIN_REQ: u16 = 112;
    pub const PLAYER_LOGIN_RSP: u16 = 135;
    pub const PLAYER_FORCE_EXIT_RSP: u16 = 159;
    pub const GET_PLAYER_TOKEN_REQ: u16 = 172;
    pub const PLAYER_FORCE_EXIT_REQ: u16 = 189;
    pub const GET_PLAYER_TOKEN_RSP: u16 = 198;
    pub const OBSTACLE_MODIFY_NOTIFY: u16 = 2312;
    pub const QUERY_PATH_REQ: u16 = 2372;
    pub const QUERY_PATH_RSP: u16 = 2398;

    /// Commands also served by the pathfinding worker
    pub fn is_path_cmd(cmd_id: u16) -> bool {
        matches!(cmd_id, QUERY_PATH_REQ | OBSTACLE_MODIFY_NOTIFY)
    }
}

/// Transport head carried in front of every body
#[derive(Clone, PartialEq, Message)]
pub struct PacketHead {
    #[prost(uint32, tag = "1")]
    pub packet_id: u32,
    #[prost(uint32, tag = "2")]
    pub rpc_id: u32,
    #[prost(uint32, tag = "3")]
    pub client_sequence_id: u32,
    #[prost(uint32, tag = "4")]
    pub enet_channel_id: u32,
    #[prost(uint32, tag = "5")]
    pub enet_is_reliable: u32,
    #[prost(uint64, tag = "6")]
    pub sent_ms: u64,
    #[prost(uint32, tag = "8")]
    pub server_sequence_id: u32,
    #[prost(uint32, tag = "11")]
    pub user_id: u32,
    #[prost(uint32, tag = "12")]
    pub user_ip: u32,
    #[prost(uint32, tag = "13")]
    pub user_session_id: u32,
    #[prost(uint64, tag = "21")]
    pub recv_time_ms: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetPlayerTokenReq {
    #[prost(uint32, tag = "1")]
    pub account_type: u32,
    #[prost(string, tag = "2")]
    pub account_uid: String,
    #[prost(string, tag = "3")]
    pub account_token: String,
    #[prost(uint32, tag = "4")]
    pub uid: u32,
    #[prost(uint32, tag = "5")]
    pub platform_type: u32,
    #[prost(uint32, tag = "6")]
    pub channel_id: u32,
    #[prost(uint32, tag = "7")]
    pub sub_channel_id: u32,
    /// Base64 of the RSA-encrypted 8-byte client seed
    #[prost(string, tag = "8")]
    pub client_rand_key: String,
    #[prost(uint32, tag = "9")]
    pub key_id: u32,
    #[prost(uint32, tag = "10")]
    pub lang: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetPlayerTokenRsp {
    #[prost(int32, tag = "1")]
    pub retcode: i32,
    #[prost(string, tag = "2")]
    pub msg: String,
    #[prost(uint32, tag = "3")]
    pub uid: u32,
    #[prost(string, tag = "4")]
    pub token: String,
    #[prost(uint32, tag = "5")]
    pub account_type: u32,
    #[prost(string, tag = "6")]
    pub account_uid: String,
    #[prost(uint32, tag = "7")]
    pub channel_id: u32,
    #[prost(uint32, tag = "8")]
    pub platform_type: u32,
    #[prost(string, tag = "9")]
    pub client_ip_str: String,
    #[prost(bytes = "vec", tag = "10")]
    pub security_cmd_buffer: Vec<u8>,
    #[prost(string, tag = "11")]
    pub client_version_random_key: String,
    #[prost(uint64, tag = "12")]
    pub secret_key_seed: u64,
    #[prost(string, tag = "13")]
    pub secret_key: String,
    #[prost(uint32, tag = "14")]
    pub key_id: u32,
    #[prost(string, tag = "15")]
    pub server_rand_key: String,
    #[prost(string, tag = "16")]
    pub sign: String,
    #[prost(uint32, tag = "17")]
    pub black_uid_end_time: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PlayerLoginReq {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub client_version: String,
    #[prost(uint32, tag = "3")]
    pub platform_type: u32,
    #[prost(uint32, tag = "4")]
    pub target_uid: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PlayerLoginRsp {
    #[prost(int32, tag = "1")]
    pub retcode: i32,
    #[prost(bool, tag = "2")]
    pub is_new_player: bool,
    #[prost(uint32, tag = "3")]
    pub target_uid: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PingReq {
    #[prost(uint32, tag = "1")]
    pub client_time: u32,
    #[prost(uint32, tag = "2")]
    pub seq: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PingRsp {
    #[prost(int32, tag = "1")]
    pub retcode: i32,
    #[prost(uint32, tag = "2")]
    pub client_time: u32,
    #[prost(uint32, tag = "3")]
    pub seq: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PlayerForceExitReq {}

#[derive(Clone, PartialEq, Message)]
pub struct PlayerForceExitRsp {
    #[prost(int32, tag = "1")]
    pub retcode: i32,
}

/// Decodes a head, treating an empty head as the default
pub fn decode_head(bytes: &[u8]) -> Result<PacketHead, prost::DecodeError> {
    PacketHead::decode(bytes)
}
