//! Session keystream derivation
//!
//! Every proto frame on the wire is XOR-whitened with a 4096-byte keystream.
//! Before login a session uses the dispatch keystream handed out by the
//! control plane; once the login response has been queued the session
//! switches to a keystream derived from the negotiated 64-bit seed.
//!
//! The whitening is a compatibility layer with the existing client, not a
//! confidentiality mechanism: anyone who observes the seed exchange in
//! normal mode can rebuild the keystream.
//!
//! Derivation uses MT19937-64 and emits 512 outputs as big-endian words.

/// Length of every keystream in bytes
pub const KEYSTREAM_LEN: usize = 4096;

const NN: usize = 312;
const MM: usize = 156;
const MATRIX_A: u64 = 0xB502_6F5A_A966_19E9;
const UPPER_MASK: u64 = 0xFFFF_FFFF_8000_0000;
const LOWER_MASK: u64 = 0x7FFF_FFFF;

/// 64-bit Mersenne Twister used to expand a seed into a keystream
#[derive(Clone)]
pub struct Mt19937_64 {
    state: [u64; NN],
    index: usize,
}

impl Mt19937_64 {
    pub fn new(seed: u64) -> Self {
        let mut mt = Self {
            state: [0; NN],
            index: NN,
        };
        mt.reseed(seed);
        mt
    }

    /// Resets the generator state from a new seed
    pub fn reseed(&mut self, seed: u64) {
        self.state[0] = seed;
        for i in 1..NN {
            let prev = self.state[i - 1];
            self.state[i] = 6_364_136_223_846_793_005u64
                .wrapping_mul(prev ^ (prev >> 62))
                .wrapping_add(i as u64);
        }
        self.index = NN;
    }

    fn twist(&mut self) {
        let mag01 = |x: u64| if x & 1 == 0 { 0 } else { MATRIX_A };

        for i in 0..NN - MM {
            let x = (self.state[i] & UPPER_MASK) | (self.state[i + 1] & LOWER_MASK);
            self.state[i] = self.state[i + MM] ^ (x >> 1) ^ mag01(x);
        }
        for i in NN - MM..NN - 1 {
            let x = (self.state[i] & UPPER_MASK) | (self.state[i + 1] & LOWER_MASK);
            self.state[i] = self.state[i + MM - NN] ^ (x >> 1) ^ mag01(x);
        }
        let x = (self.state[NN - 1] & UPPER_MASK) | (self.state[0] & LOWER_MASK);
        self.state[NN - 1] = self.state[MM - 1] ^ (x >> 1) ^ mag01(x);

        self.index = 0;
    }

    pub fn next_u64(&mut self) -> u64 {
        if self.index >= NN {
            self.twist();
        }

        let mut x = self.state[self.index];
        self.index += 1;

        x ^= (x >> 29) & 0x5555_5555_5555_5555;
        x ^= (x << 17) & 0x71D6_7FFF_EDA6_0000;
        x ^= (x << 37) & 0xFFF7_EEE0_0000_0000;
        x ^= x >> 43;
        x
    }
}

/// How a seed is fed to the generator before the keystream is emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMode {
    /// The seed initialises the generator directly
    Normal,
    /// The generator is re-seeded with its own first output and one more
    /// output is discarded before emission
    Magic,
}

/// A 4096-byte whitening stream
#[derive(Clone, PartialEq, Eq)]
pub struct Keystream {
    seed: Option<u64>,
    bytes: Vec<u8>,
}

impl std::fmt::Debug for Keystream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystream")
            .field("seed", &self.seed)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Keystream {
    /// Expands a 64-bit seed into a keystream
    pub fn derive(seed: u64, mode: SeedMode) -> Self {
        let mut mt = Mt19937_64::new(seed);
        if mode == SeedMode::Magic {
            let reseed = mt.next_u64();
            mt.reseed(reseed);
            mt.next_u64();
        }

        let mut bytes = Vec::with_capacity(KEYSTREAM_LEN);
        for _ in 0..KEYSTREAM_LEN / 8 {
            bytes.extend_from_slice(&mt.next_u64().to_be_bytes());
        }

        Self {
            seed: Some(seed),
            bytes,
        }
    }

    /// Wraps raw key material. Empty input yields `None`.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        Some(Self { seed: None, bytes })
    }

    /// The seed this keystream was derived from, if any
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// XORs `data` in place, cycling the keystream from its first byte
    pub fn apply(&self, data: &mut [u8]) {
        let len = self.bytes.len();
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.bytes[i % len];
        }
    }
}
