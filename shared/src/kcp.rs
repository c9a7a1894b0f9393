//! Reliable-UDP segment engine
//!
//! A KCP-style ARQ with the fixed profile spoken by the existing client:
//! every segment starts with a 28-byte little-endian header
//!
//! ```text
//! conv(4) token(4) cmd(1) frg(1) wnd(2) ts(4) sn(4) una(4) len(4)
//! ```
//!
//! The engine is sans-io. Callers feed received datagrams to [`Kcp::input`],
//! drive timers through [`Kcp::update`] and drain datagrams to send with
//! [`Kcp::pop_output`]. Messages are delivered whole and in order by
//! [`Kcp::recv`].

use std::collections::VecDeque;

/// Size of a segment header
pub const KCP_OVERHEAD: usize = 28;

pub const CMD_PUSH: u8 = 81;
pub const CMD_ACK: u8 = 82;
pub const CMD_WASK: u8 = 83;
pub const CMD_WINS: u8 = 84;

const ASK_SEND: u32 = 1;
const ASK_TELL: u32 = 2;

const RTO_NDL: u32 = 30;
const RTO_MIN: u32 = 100;
const RTO_DEF: u32 = 200;
const RTO_MAX: u32 = 60_000;

const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;

const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;

const FASTACK_LIMIT: u32 = 5;
const DEAD_LINK: u32 = 20;

/// Largest number of fragments a single message may span
const MAX_FRAGMENTS: usize = 255;

#[inline]
fn timediff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Reads conv and token from the front of a segment datagram
pub fn peek_conv_token(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < KCP_OVERHEAD {
        return None;
    }
    let conv = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let token = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    Some((conv, token))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KcpError {
    #[error("segment truncated")]
    Truncated,
    #[error("conv mismatch: expected {expected}, got {got}")]
    ConvMismatch { expected: u32, got: u32 },
    #[error("token mismatch for conv {0}")]
    TokenMismatch(u32),
    #[error("unknown segment command {0}")]
    UnknownCommand(u8),
    #[error("cannot send an empty message")]
    EmptyMessage,
    #[error("message of {0} bytes needs too many fragments")]
    MessageTooLarge(usize),
}

/// Tunables of the transport profile
#[derive(Debug, Clone)]
pub struct KcpConfig {
    pub mtu: usize,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
    /// Internal flush interval in milliseconds
    pub interval: u32,
    pub nodelay: bool,
    pub fast_resend: u32,
    /// Disables the congestion window
    pub no_cwnd: bool,
    /// Flush ACKs right after input instead of waiting for the next tick
    pub ack_nodelay: bool,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mtu: 1200,
            snd_wnd: 256,
            rcv_wnd: 256,
            interval: 10,
            nodelay: true,
            fast_resend: 2,
            no_cwnd: true,
            ack_nodelay: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Segment {
    cmd: u8,
    frg: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    resendts: u32,
    rto: u32,
    fastack: u32,
    xmit: u32,
    data: Vec<u8>,
}

impl Segment {
    fn with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }
}

/// Appends one segment to the pending datagram, spilling to `output` when the
/// MTU would be exceeded
fn emit(
    buffer: &mut Vec<u8>,
    output: &mut VecDeque<Vec<u8>>,
    mtu: usize,
    conv: u32,
    token: u32,
    seg: &Segment,
) {
    if !buffer.is_empty() && buffer.len() + KCP_OVERHEAD + seg.data.len() > mtu {
        output.push_back(std::mem::take(buffer));
    }
    buffer.extend_from_slice(&conv.to_le_bytes());
    buffer.extend_from_slice(&token.to_le_bytes());
    buffer.push(seg.cmd);
    buffer.push(seg.frg);
    buffer.extend_from_slice(&seg.wnd.to_le_bytes());
    buffer.extend_from_slice(&seg.ts.to_le_bytes());
    buffer.extend_from_slice(&seg.sn.to_le_bytes());
    buffer.extend_from_slice(&seg.una.to_le_bytes());
    buffer.extend_from_slice(&(seg.data.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&seg.data);
}

pub struct Kcp {
    conv: u32,
    token: u32,
    mtu: usize,
    mss: usize,
    dead: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttval: i32,
    rx_srtt: i32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    incr: u32,
    probe: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,
    ts_probe: u32,
    probe_wait: u32,

    nodelay: bool,
    fast_resend: u32,
    no_cwnd: bool,
    ack_nodelay: bool,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,

    buffer: Vec<u8>,
    output: VecDeque<Vec<u8>>,
}

impl Kcp {
    pub fn new(conv: u32, token: u32, config: &KcpConfig) -> Self {
        let mtu = config.mtu.max(KCP_OVERHEAD + 1);
        Self {
            conv,
            token,
            mtu,
            mss: mtu - KCP_OVERHEAD,
            dead: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_minrto: if config.nodelay { RTO_NDL } else { RTO_MIN },
            snd_wnd: config.snd_wnd as u32,
            rcv_wnd: config.rcv_wnd as u32,
            rmt_wnd: config.rcv_wnd as u32,
            cwnd: 1,
            incr: 0,
            probe: 0,
            current: 0,
            interval: config.interval.clamp(10, 5000),
            ts_flush: 0,
            updated: false,
            ts_probe: 0,
            probe_wait: 0,
            nodelay: config.nodelay,
            fast_resend: config.fast_resend,
            no_cwnd: config.no_cwnd,
            ack_nodelay: config.ack_nodelay,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            buffer: Vec::with_capacity(mtu),
            output: VecDeque::new(),
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    /// Smoothed round-trip time in milliseconds
    pub fn srtt(&self) -> u32 {
        self.rx_srtt.max(0) as u32
    }

    /// Current retransmission timeout in milliseconds
    pub fn rto(&self) -> u32 {
        self.rx_rto
    }

    /// Segments queued or in flight
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// True once a segment has been retransmitted too many times
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Largest message [`Kcp::send`] accepts
    ///
    /// A message spans at most 255 fragments and must fit the receive window.
    pub fn max_message_len(&self) -> usize {
        let fragments = MAX_FRAGMENTS.min((self.rcv_wnd as usize).saturating_sub(1));
        fragments * self.mss
    }

    /// Queues a message for reliable delivery
    pub fn send(&mut self, data: &[u8]) -> Result<(), KcpError> {
        if data.is_empty() {
            return Err(KcpError::EmptyMessage);
        }
        if data.len() > self.max_message_len() {
            return Err(KcpError::MessageTooLarge(data.len()));
        }

        let count = data.len().div_ceil(self.mss);

        for (i, chunk) in data.chunks(self.mss).enumerate() {
            let mut seg = Segment::with_data(chunk.to_vec());
            seg.frg = (count - i - 1) as u8;
            self.snd_queue.push_back(seg);
        }
        Ok(())
    }

    /// Size of the next complete message, if one is ready
    pub fn peek_size(&self) -> Option<usize> {
        let front = self.rcv_queue.front()?;
        if front.frg == 0 {
            return Some(front.data.len());
        }
        if self.rcv_queue.len() < front.frg as usize + 1 {
            return None;
        }

        let mut len = 0;
        for seg in &self.rcv_queue {
            len += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(len)
    }

    /// Pops the next complete message
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        let size = self.peek_size()?;
        let recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let mut message = Vec::with_capacity(size);
        while let Some(seg) = self.rcv_queue.pop_front() {
            message.extend_from_slice(&seg.data);
            if seg.frg == 0 {
                break;
            }
        }

        self.move_to_rcv_queue();

        if recover && (self.rcv_queue.len() as u32) < self.rcv_wnd {
            self.probe |= ASK_TELL;
        }
        Some(message)
    }

    /// Feeds one received datagram, which may hold several segments
    pub fn input(&mut self, data: &[u8]) -> Result<(), KcpError> {
        if data.len() < KCP_OVERHEAD {
            return Err(KcpError::Truncated);
        }

        let prev_una = self.snd_una;
        let mut max_ack: Option<(u32, u32)> = None;
        let mut rest = data;

        while rest.len() >= KCP_OVERHEAD {
            let le32 = |i: usize| u32::from_le_bytes([rest[i], rest[i + 1], rest[i + 2], rest[i + 3]]);
            let conv = le32(0);
            let token = le32(4);
            let cmd = rest[8];
            let frg = rest[9];
            let wnd = u16::from_le_bytes([rest[10], rest[11]]);
            let ts = le32(12);
            let sn = le32(16);
            let una = le32(20);
            let len = le32(24) as usize;

            if conv != self.conv {
                return Err(KcpError::ConvMismatch {
                    expected: self.conv,
                    got: conv,
                });
            }
            if token != self.token {
                return Err(KcpError::TokenMismatch(conv));
            }
            if rest.len() < KCP_OVERHEAD + len {
                return Err(KcpError::Truncated);
            }
            if !matches!(cmd, CMD_PUSH | CMD_ACK | CMD_WASK | CMD_WINS) {
                return Err(KcpError::UnknownCommand(cmd));
            }

            self.rmt_wnd = wnd as u32;
            self.parse_una(una);
            self.shrink_buf();

            match cmd {
                CMD_ACK => {
                    if timediff(self.current, ts) >= 0 {
                        self.update_ack(timediff(self.current, ts));
                    }
                    self.parse_ack(sn);
                    self.shrink_buf();
                    max_ack = match max_ack {
                        Some((max_sn, _)) if timediff(sn, max_sn) <= 0 => max_ack,
                        _ => Some((sn, ts)),
                    };
                }
                CMD_PUSH => {
                    if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.acklist.push((sn, ts));
                        if timediff(sn, self.rcv_nxt) >= 0 {
                            let seg = Segment {
                                cmd,
                                frg,
                                wnd,
                                ts,
                                sn,
                                una,
                                data: rest[KCP_OVERHEAD..KCP_OVERHEAD + len].to_vec(),
                                ..Default::default()
                            };
                            self.parse_data(seg);
                        }
                    }
                }
                CMD_WASK => self.probe |= ASK_TELL,
                _ => {}
            }

            rest = &rest[KCP_OVERHEAD + len..];
        }

        if let Some((sn, ts)) = max_ack {
            self.parse_fastack(sn, ts);
        }

        if timediff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            let mss = self.mss as u32;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr += mss;
            } else {
                self.incr = self.incr.max(mss);
                self.incr += (mss * mss) / self.incr + mss / 16;
                if (self.cwnd + 1) * mss <= self.incr {
                    self.cwnd = (self.incr + mss - 1) / mss.max(1);
                }
            }
            if self.cwnd > self.rmt_wnd {
                self.cwnd = self.rmt_wnd;
                self.incr = self.rmt_wnd * mss;
            }
        }

        if self.ack_nodelay && !self.acklist.is_empty() {
            self.flush();
        }
        Ok(())
    }

    /// Advances the clock; flushes when the interval has elapsed
    pub fn update(&mut self, current: u32) {
        self.current = current;
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = timediff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if timediff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    /// Next datagram ready for the wire
    pub fn pop_output(&mut self) -> Option<Vec<u8>> {
        self.output.pop_front()
    }

    fn wnd_unused(&self) -> u16 {
        let queued = self.rcv_queue.len() as u32;
        if queued < self.rcv_wnd {
            (self.rcv_wnd - queued) as u16
        } else {
            0
        }
    }

    fn update_ack(&mut self, rtt: i32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = (rtt - self.rx_srtt).abs();
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = (7 * self.rx_srtt + rtt) / 8;
            if self.rx_srtt < 1 {
                self.rx_srtt = 1;
            }
        }
        let rto = self.rx_srtt as u32 + self.interval.max(4 * self.rx_rttval.max(0) as u32);
        self.rx_rto = rto.clamp(self.rx_minrto, RTO_MAX);
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_ack(&mut self, sn: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            let seg_sn = self.snd_buf[i].sn;
            if seg_sn == sn {
                self.snd_buf.remove(i);
                break;
            }
            if timediff(sn, seg_sn) < 0 {
                break;
            }
        }
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if timediff(una, seg.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32, ts: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if timediff(sn, seg.sn) < 0 {
                break;
            }
            if sn != seg.sn && timediff(ts, seg.ts) >= 0 {
                seg.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, seg: Segment) {
        let sn = seg.sn;
        if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0
            || timediff(sn, self.rcv_nxt) < 0
        {
            return;
        }

        let mut insert_at = 0;
        let mut repeat = false;
        for i in (0..self.rcv_buf.len()).rev() {
            let existing = self.rcv_buf[i].sn;
            if existing == sn {
                repeat = true;
                break;
            }
            if timediff(sn, existing) > 0 {
                insert_at = i + 1;
                break;
            }
        }
        if !repeat {
            self.rcv_buf.insert(insert_at, seg);
        }

        self.move_to_rcv_queue();
    }

    fn move_to_rcv_queue(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && (self.rcv_queue.len() as u32) < self.rcv_wnd {
                if let Some(seg) = self.rcv_buf.pop_front() {
                    self.rcv_queue.push_back(seg);
                }
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            } else {
                break;
            }
        }
    }

    /// Writes pending ACKs, probes and data segments to the output queue
    pub fn flush(&mut self) {
        if !self.updated {
            return;
        }

        let wnd = self.wnd_unused();
        let current = self.current;

        let mut ack = Segment {
            cmd: CMD_ACK,
            wnd,
            una: self.rcv_nxt,
            ..Default::default()
        };
        for &(sn, ts) in &self.acklist {
            ack.sn = sn;
            ack.ts = ts;
            emit(&mut self.buffer, &mut self.output, self.mtu, self.conv, self.token, &ack);
        }
        self.acklist.clear();

        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if timediff(current, self.ts_probe) >= 0 {
                self.probe_wait = self.probe_wait.max(PROBE_INIT);
                self.probe_wait += self.probe_wait / 2;
                self.probe_wait = self.probe_wait.min(PROBE_LIMIT);
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        let mut control = Segment {
            wnd,
            una: self.rcv_nxt,
            ..Default::default()
        };
        if self.probe & ASK_SEND != 0 {
            control.cmd = CMD_WASK;
            emit(&mut self.buffer, &mut self.output, self.mtu, self.conv, self.token, &control);
        }
        if self.probe & ASK_TELL != 0 {
            control.cmd = CMD_WINS;
            emit(&mut self.buffer, &mut self.output, self.mtu, self.conv, self.token, &control);
        }
        self.probe = 0;

        let mut cwnd = self.snd_wnd.min(self.rmt_wnd);
        if !self.no_cwnd {
            cwnd = cwnd.min(self.cwnd);
        }

        while timediff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.cmd = CMD_PUSH;
            seg.wnd = wnd;
            seg.ts = current;
            seg.sn = self.snd_nxt;
            seg.una = self.rcv_nxt;
            seg.resendts = current;
            seg.rto = self.rx_rto;
            seg.fastack = 0;
            seg.xmit = 0;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        let resent = if self.fast_resend > 0 {
            self.fast_resend
        } else {
            u32::MAX
        };
        let rtomin = if self.nodelay { 0 } else { self.rx_rto >> 3 };

        let mut lost = false;
        let mut change = false;
        for seg in self.snd_buf.iter_mut() {
            let mut needsend = false;
            if seg.xmit == 0 {
                needsend = true;
                seg.xmit += 1;
                seg.rto = self.rx_rto;
                seg.resendts = current.wrapping_add(seg.rto + rtomin);
            } else if timediff(current, seg.resendts) >= 0 {
                needsend = true;
                seg.xmit += 1;
                if self.nodelay {
                    seg.rto += self.rx_rto / 2;
                } else {
                    seg.rto += seg.rto.max(self.rx_rto);
                }
                seg.resendts = current.wrapping_add(seg.rto);
                lost = true;
            } else if seg.fastack >= resent && seg.xmit <= FASTACK_LIMIT {
                needsend = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resendts = current.wrapping_add(seg.rto);
                change = true;
            }

            if needsend {
                seg.ts = current;
                seg.wnd = wnd;
                seg.una = self.rcv_nxt;
                emit(&mut self.buffer, &mut self.output, self.mtu, self.conv, self.token, seg);
                if seg.xmit >= DEAD_LINK {
                    self.dead = true;
                }
            }
        }

        if !self.buffer.is_empty() {
            self.output.push_back(std::mem::take(&mut self.buffer));
        }

        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = (inflight / 2).max(THRESH_MIN);
            self.cwnd = self.ssthresh + resent;
            self.incr = self.cwnd * self.mss as u32;
        }
        if lost {
            self.ssthresh = (cwnd / 2).max(THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
    }
}
