//! Result codes returned to the client and reasons for closing a session

use serde::{Deserialize, Serialize};
use std::fmt;

/// Retcode carried in `GetPlayerTokenRsp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Retcode {
    Succ = 0,
    SvrError = 1,
    StopServer = 11,
    AccountVerifyError = 12,
    AnotherLogin = 19,
    BlackUid = 21,
    MaxPlayer = 25,
}

impl Retcode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Succ),
            1 => Some(Self::SvrError),
            11 => Some(Self::StopServer),
            12 => Some(Self::AccountVerifyError),
            19 => Some(Self::AnotherLogin),
            21 => Some(Self::BlackUid),
            25 => Some(Self::MaxPlayer),
            _ => None,
        }
    }
}

impl fmt::Display for Retcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Succ => "succ",
            Self::SvrError => "server-error",
            Self::StopServer => "stop-server",
            Self::AccountVerifyError => "account-verify-error",
            Self::AnotherLogin => "another-login",
            Self::BlackUid => "black-uid",
            Self::MaxPlayer => "max-player",
        };
        f.write_str(name)
    }
}

/// Why a session was closed. The numeric value travels to the client in the
/// transport disconnect packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CloseReason {
    Timeout = 0,
    ClientClose = 1,
    ServerRelogin = 4,
    ServerKick = 5,
    ServerShutdown = 6,
    PacketFreqTooHigh = 9,
    WaitSendMax = 20,
}

impl CloseReason {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Unknown codes map to `ServerKick`
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Timeout,
            1 => Self::ClientClose,
            4 => Self::ServerRelogin,
            6 => Self::ServerShutdown,
            9 => Self::PacketFreqTooHigh,
            20 => Self::WaitSendMax,
            _ => Self::ServerKick,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::ClientClose => "client-close",
            Self::ServerRelogin => "server-relogin",
            Self::ServerKick => "server-kick",
            Self::ServerShutdown => "server-shutdown",
            Self::PacketFreqTooHigh => "packet-freq-too-high",
            Self::WaitSendMax => "wait-send-max",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retcode_roundtrip_codes() {
        for rc in [
            Retcode::Succ,
            Retcode::SvrError,
            Retcode::StopServer,
            Retcode::AccountVerifyError,
            Retcode::AnotherLogin,
            Retcode::BlackUid,
            Retcode::MaxPlayer,
        ] {
            assert_eq!(Retcode::from_code(rc.code()), Some(rc));
        }
        assert_eq!(Retcode::from_code(-7), None);
    }

    #[test]
    fn test_close_reason_unknown_is_kick() {
        assert_eq!(CloseReason::from_code(999), CloseReason::ServerKick);
        assert_eq!(CloseReason::from_code(4), CloseReason::ServerRelogin);
        assert_eq!(CloseReason::WaitSendMax.to_string(), "wait-send-max");
    }
}
