//! Connection control datagrams of the reliable-UDP transport
//!
//! Control datagrams are exactly 20 bytes, big-endian:
//! `kind(4) conv(4) token(4) data(4) magic(4)`. Anything else arriving on
//! the socket is a reliable-UDP segment.

pub const CONTROL_LEN: usize = 20;

const CONNECT_KIND: u32 = 0x0000_00FF;
const CONNECT_MAGIC: u32 = 0xFFFF_FFFF;
const ESTABLISH_KIND: u32 = 0x0000_0145;
const ESTABLISH_MAGIC: u32 = 0x1451_4545;
const DISCONNECT_KIND: u32 = 0x0000_0194;
const DISCONNECT_MAGIC: u32 = 0x1941_9494;

/// Handshake constant carried in the data field of connect and establish
pub const CONNECT_KEY: u32 = 1_234_567_890;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnetControl {
    Connect,
    Establish { conv: u32, token: u32 },
    Disconnect { conv: u32, token: u32, reason: u32 },
}

impl EnetControl {
    pub fn encode(&self) -> [u8; CONTROL_LEN] {
        let (kind, conv, token, data, magic) = match *self {
            EnetControl::Connect => (CONNECT_KIND, 0, 0, CONNECT_KEY, CONNECT_MAGIC),
            EnetControl::Establish { conv, token } => {
                (ESTABLISH_KIND, conv, token, CONNECT_KEY, ESTABLISH_MAGIC)
            }
            EnetControl::Disconnect { conv, token, reason } => {
                (DISCONNECT_KIND, conv, token, reason, DISCONNECT_MAGIC)
            }
        };

        let mut out = [0u8; CONTROL_LEN];
        out[0..4].copy_from_slice(&kind.to_be_bytes());
        out[4..8].copy_from_slice(&conv.to_be_bytes());
        out[8..12].copy_from_slice(&token.to_be_bytes());
        out[12..16].copy_from_slice(&data.to_be_bytes());
        out[16..20].copy_from_slice(&magic.to_be_bytes());
        out
    }

    /// Returns `None` for anything that is not a well-formed control datagram
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != CONTROL_LEN {
            return None;
        }
        let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let (kind, conv, token, value, magic) = (word(0), word(4), word(8), word(12), word(16));

        match (kind, magic) {
            (CONNECT_KIND, CONNECT_MAGIC) if value == CONNECT_KEY => Some(EnetControl::Connect),
            (ESTABLISH_KIND, ESTABLISH_MAGIC) if value == CONNECT_KEY => {
                Some(EnetControl::Establish { conv, token })
            }
            (DISCONNECT_KIND, DISCONNECT_MAGIC) => Some(EnetControl::Disconnect {
                conv,
                token,
                reason: value,
            }),
            _ => None,
        }
    }
}
