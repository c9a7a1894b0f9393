//! Integrity trailers mixed into reliable-UDP datagrams

/// Selects the hash appended to each datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteCheckMode {
    #[default]
    None,
    Crc32,
    Fnv1a,
}

const FNV_OFFSET: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(data: &[u8]) -> u32 {
    data.iter()
        .fold(FNV_OFFSET, |hash, &b| (hash ^ b as u32).wrapping_mul(FNV_PRIME))
}

impl ByteCheckMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Crc32),
            2 => Some(Self::Fnv1a),
            _ => None,
        }
    }

    pub fn trailer_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Crc32 | Self::Fnv1a => 4,
        }
    }

    fn hash(self, data: &[u8]) -> Option<u32> {
        match self {
            Self::None => None,
            Self::Crc32 => Some(crc32fast::hash(data)),
            Self::Fnv1a => Some(fnv1a(data)),
        }
    }

    /// Appends the trailer to an outgoing datagram
    pub fn seal(self, datagram: &mut Vec<u8>) {
        if let Some(hash) = self.hash(datagram) {
            datagram.extend_from_slice(&hash.to_le_bytes());
        }
    }

    /// Verifies and strips the trailer; `None` means the datagram is corrupt
    pub fn open(self, datagram: &[u8]) -> Option<&[u8]> {
        let trailer = self.trailer_len();
        if trailer == 0 {
            return Some(datagram);
        }
        if datagram.len() < trailer {
            return None;
        }
        let (body, tail) = datagram.split_at(datagram.len() - trailer);
        let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        match self.hash(body) {
            Some(hash) if hash == expected => Some(body),
            _ => None,
        }
    }
}
