//! Proto frame codec
//!
//! A proto frame has a fixed big-endian envelope:
//!
//! ```text
//! magic_head(2)=0x4567 | cmd_id(2) | head_len(2) | body_len(4) | head | body | magic_tail(2)=0x89AB
//! ```
//!
//! The bytes of a whole transport chunk (one reliable-UDP message or one TCP
//! length-prefixed chunk) are XOR-whitened with the session keystream before
//! they hit the wire. A chunk may carry several frames back to back.
//!
//! The codec never looks inside bodies: unknown cmd ids decode like any
//! other frame.

use crate::keystream::Keystream;

pub const HEAD_MAGIC: u16 = 0x4567;
pub const TAIL_MAGIC: u16 = 0x89AB;

/// Fixed bytes around head and body
pub const ENVELOPE_LEN: usize = 12;

/// Largest body a frame may carry (343 KiB)
pub const MAX_BODY_LEN: usize = 343 * 1024;

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoFrame {
    pub cmd_id: u16,
    pub head: Vec<u8>,
    pub body: Vec<u8>,
}

impl ProtoFrame {
    pub fn new(cmd_id: u16, head: Vec<u8>, body: Vec<u8>) -> Self {
        Self { cmd_id, head, body }
    }

    /// Size of this frame on the wire
    pub fn wire_len(&self) -> usize {
        ENVELOPE_LEN + self.head.len() + self.body.len()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty chunk")]
    Empty,
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("bad head magic {0:#06x}")]
    BadHeadMagic(u16),
    #[error("bad tail magic {0:#06x}")]
    BadTailMagic(u16),
    #[error("frame body of {0} bytes exceeds limit")]
    BodyTooLarge(usize),
    #[error("frame head of {0} bytes exceeds limit")]
    HeadTooLarge(usize),
}

fn write_frame(out: &mut Vec<u8>, cmd_id: u16, head: &[u8], body: &[u8]) {
    out.extend_from_slice(&HEAD_MAGIC.to_be_bytes());
    out.extend_from_slice(&cmd_id.to_be_bytes());
    out.extend_from_slice(&(head.len() as u16).to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(head);
    out.extend_from_slice(body);
    out.extend_from_slice(&TAIL_MAGIC.to_be_bytes());
}

/// Builds one whitened frame. The head length must fit the 16-bit field.
pub fn encode(
    cmd_id: u16,
    head: &[u8],
    body: &[u8],
    keystream: &Keystream,
) -> Result<Vec<u8>, FrameError> {
    if head.len() > u16::MAX as usize {
        return Err(FrameError::HeadTooLarge(head.len()));
    }
    if body.len() > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(body.len()));
    }

    let mut out = Vec::with_capacity(ENVELOPE_LEN + head.len() + body.len());
    write_frame(&mut out, cmd_id, head, body);
    keystream.apply(&mut out);
    Ok(out)
}

/// Packs several frames into one whitened chunk
pub fn encode_batch(frames: &[ProtoFrame], keystream: &Keystream) -> Result<Vec<u8>, FrameError> {
    let total: usize = frames.iter().map(ProtoFrame::wire_len).sum();
    let mut out = Vec::with_capacity(total);
    for frame in frames {
        if frame.head.len() > u16::MAX as usize {
            return Err(FrameError::HeadTooLarge(frame.head.len()));
        }
        if frame.body.len() > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge(frame.body.len()));
        }
        write_frame(&mut out, frame.cmd_id, &frame.head, &frame.body);
    }
    keystream.apply(&mut out);
    Ok(out)
}

/// Unwhitens a chunk and splits it into frames
///
/// Any structural defect rejects the whole chunk; a chunk whitened with the
/// wrong keystream fails the head magic check for all but 1 in 65536 inputs.
pub fn decode(bin: &[u8], keystream: &Keystream) -> Result<Vec<ProtoFrame>, FrameError> {
    if bin.is_empty() {
        return Err(FrameError::Empty);
    }

    let mut data = bin.to_vec();
    keystream.apply(&mut data);

    let mut frames = Vec::new();
    let mut rest: &[u8] = &data;
    while !rest.is_empty() {
        let (frame, used) = decode_one(rest)?;
        frames.push(frame);
        rest = &rest[used..];
    }
    Ok(frames)
}

fn decode_one(data: &[u8]) -> Result<(ProtoFrame, usize), FrameError> {
    if data.len() < ENVELOPE_LEN {
        return Err(FrameError::Truncated {
            needed: ENVELOPE_LEN,
            available: data.len(),
        });
    }

    let head_magic = u16::from_be_bytes([data[0], data[1]]);
    if head_magic != HEAD_MAGIC {
        return Err(FrameError::BadHeadMagic(head_magic));
    }

    let cmd_id = u16::from_be_bytes([data[2], data[3]]);
    let head_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    let body_len = u32::from_be_bytes([data[6], data[7], data[8], data[9]]) as usize;
    if body_len > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(body_len));
    }

    let total = ENVELOPE_LEN + head_len + body_len;
    if data.len() < total {
        return Err(FrameError::Truncated {
            needed: total,
            available: data.len(),
        });
    }

    let tail_at = 10 + head_len + body_len;
    let tail_magic = u16::from_be_bytes([data[tail_at], data[tail_at + 1]]);
    if tail_magic != TAIL_MAGIC {
        return Err(FrameError::BadTailMagic(tail_magic));
    }

    let head = data[10..10 + head_len].to_vec();
    let body = data[10 + head_len..tail_at].to_vec();
    Ok((ProtoFrame { cmd_id, head, body }, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystream::SeedMode;

    fn ks(seed: u64) -> Keystream {
        Keystream::derive(seed, SeedMode::Normal)
    }

    #[test]
    fn test_encode_decode_single_frame() {
        let key = ks(1);
        let bin = encode(172, b"head", b"body bytes", &key).unwrap();
        let frames = decode(&bin, &key).unwrap();

        assert_eq!(frames, vec![ProtoFrame::new(172, b"head".to_vec(), b"body bytes".to_vec())]);
    }

    #[test]
    fn test_envelope_layout_with_zero_keystream() {
        let key = Keystream::from_bytes(vec![0u8; 16]).unwrap();
        let bin = encode(0x0102, &[0xAA], &[0xBB, 0xCC], &key).unwrap();

        assert_eq!(
            bin,
            vec![
                0x45, 0x67, // head magic
                0x01, 0x02, // cmd id
                0x00, 0x01, // head len
                0x00, 0x00, 0x00, 0x02, // body len
                0xAA, // head
                0xBB, 0xCC, // body
                0x89, 0xAB, // tail magic
            ]
        );
    }

    #[test]
    fn test_batch_decodes_all_frames_in_order() {
        let key = ks(2);
        let frames = vec![
            ProtoFrame::new(7, vec![1], vec![2, 3]),
            ProtoFrame::new(9999, Vec::new(), Vec::new()),
            ProtoFrame::new(112, vec![4, 5, 6], vec![7; 300]),
        ];
        let bin = encode_batch(&frames, &key).unwrap();
        assert_eq!(decode(&bin, &key).unwrap(), frames);
    }

    #[test]
    fn test_wrong_keystream_fails_structurally() {
        let bin = encode(112, b"h", b"payload", &ks(3)).unwrap();
        assert!(decode(&bin, &ks(4)).is_err());
    }

    #[test]
    fn test_truncated_chunk_is_rejected() {
        let key = ks(5);
        let bin = encode(1, b"head", b"body", &key).unwrap();
        let err = decode(&bin[..bin.len() - 3], &key).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }

    #[test]
    fn test_bad_tail_magic_is_rejected() {
        let key = Keystream::from_bytes(vec![0u8; 4]).unwrap();
        let mut bin = encode(1, b"", b"x", &key).unwrap();
        let last = bin.len() - 1;
        bin[last] = 0x00;
        assert_eq!(decode(&bin, &key).unwrap_err(), FrameError::BadTailMagic(0x8900));
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let key = ks(6);
        let body = vec![0u8; MAX_BODY_LEN + 1];
        assert_eq!(
            encode(1, &[], &body, &key).unwrap_err(),
            FrameError::BodyTooLarge(MAX_BODY_LEN + 1)
        );

        let zero = Keystream::from_bytes(vec![0u8; 1]).unwrap();
        let mut forged = Vec::new();
        forged.extend_from_slice(&HEAD_MAGIC.to_be_bytes());
        forged.extend_from_slice(&1u16.to_be_bytes());
        forged.extend_from_slice(&0u16.to_be_bytes());
        forged.extend_from_slice(&((MAX_BODY_LEN + 1) as u32).to_be_bytes());
        forged.extend_from_slice(&TAIL_MAGIC.to_be_bytes());
        assert_eq!(
            decode(&forged, &zero).unwrap_err(),
            FrameError::BodyTooLarge(MAX_BODY_LEN + 1)
        );
    }

    #[test]
    fn test_empty_chunk_is_rejected() {
        assert_eq!(decode(&[], &ks(7)).unwrap_err(), FrameError::Empty);
    }

    #[test]
    fn test_unknown_cmd_passes_through() {
        let key = ks(8);
        let bin = encode(u16::MAX, b"", b"opaque", &key).unwrap();
        let frames = decode(&bin, &key).unwrap();
        assert_eq!(frames[0].cmd_id, u16::MAX);
        assert_eq!(frames[0].body, b"opaque");
    }
}
