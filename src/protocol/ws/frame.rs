//! WS frame header codec.
//!
//! ```text
//!  0               1               2               3
//! |F|R|R|R| opcode|M| len (7)     | extended len (0, 16 or 64 bits)
//! | mask key (0 or 32 bits)       | payload ...
//! ```

use thiserror::Error;

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xa;

/// Longest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// A malformed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("reserved bits set: {0:#05b}")]
    ReservedBits(u8),
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    #[error("control frame is fragmented or longer than 125 bytes")]
    InvalidControl,
    #[error("payload length has the high bit set")]
    LengthOverflow,
}

/// A fully parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
    /// Bytes occupied by the header itself, mask key included.
    pub header_len: usize,
}

impl FrameHeader {
    pub fn is_control(&self) -> bool {
        self.opcode & 0x8 != 0
    }
}

/// Parse the header at the start of `buffer`. `Ok(None)` means more bytes
/// are needed before the header is complete.
pub fn parse_header(buffer: &[u8]) -> Result<Option<FrameHeader>, FrameError> {
    if buffer.len() < 2 {
        return Ok(None);
    }
    let first = buffer[0];
    let second = buffer[1];

    let fin = first & 0x80 != 0;
    let rsv = (first >> 4) & 0x7;
    if rsv != 0 {
        return Err(FrameError::ReservedBits(rsv));
    }
    let opcode = first & 0x0f;
    if matches!(opcode, 0x3..=0x7 | 0xb..=0xf) {
        return Err(FrameError::ReservedOpcode(opcode));
    }

    let masked = second & 0x80 != 0;
    let short_len = second & 0x7f;
    let (payload_len, mut offset) = match short_len {
        LEN_16 => {
            if buffer.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buffer[2], buffer[3]])), 4)
        }
        LEN_64 => {
            if buffer.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buffer[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(FrameError::LengthOverflow);
            }
            (len, 10)
        }
        len => (u64::from(len), 2),
    };

    if opcode & 0x8 != 0 && (!fin || payload_len > MAX_CONTROL_PAYLOAD) {
        return Err(FrameError::InvalidControl);
    }

    let mask = if masked {
        if buffer.len() < offset + 4 {
            return Ok(None);
        }
        let key = [
            buffer[offset],
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(FrameHeader {
        fin,
        opcode,
        mask,
        payload_len,
        header_len: offset,
    }))
}

/// XOR `data` with the mask key, cycling on `index % 4`.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode one frame. A mask key masks the payload.
pub fn encode_frame(fin: bool, opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    let fin_bit = if fin { 0x80 } else { 0 };
    out.push(fin_bit | (opcode & 0x0f));

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    let len = payload.len();
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(mask_bit | LEN_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LEN_64);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_field_width_follows_payload_size() {
        let cases: [(usize, usize); 7] = [
            (0, 2),
            (1, 2),
            (125, 2),
            (126, 4),
            (65535, 4),
            (65536, 10),
            (8 * 1024 * 1024 - 1, 10),
        ];
        for (len, header_len) in cases {
            let payload = vec![0x5a; len];
            let frame = encode_frame(true, OP_BINARY, &payload, None);
            let header = parse_header(&frame).expect("valid").expect("complete");
            assert_eq!(header.header_len, header_len, "length {}", len);
            assert_eq!(header.payload_len, len as u64);
            assert_eq!(frame.len(), header_len + len);
        }
    }

    #[test]
    fn masking_covers_every_phase() {
        let key = [0x11, 0x22, 0x33, 0x44];
        for len in 0..=5usize {
            let payload: Vec<u8> = (0..len as u8).map(|b| b.wrapping_mul(37)).collect();
            let frame = encode_frame(true, OP_TEXT, &payload, Some(key));
            let header = parse_header(&frame).expect("valid").expect("complete");
            assert_eq!(header.mask, Some(key));
            assert_eq!(header.header_len, 6);

            let mut body = frame[header.header_len..].to_vec();
            if len > 0 {
                assert_ne!(body, payload);
            }
            apply_mask(&mut body, key);
            assert_eq!(body, payload);
        }
    }

    #[test]
    fn incomplete_headers_wait_for_more() {
        let frame = encode_frame(true, OP_BINARY, &[0u8; 300], Some([1, 2, 3, 4]));
        for cut in 0..8 {
            assert_eq!(parse_header(&frame[..cut]), Ok(None), "cut {}", cut);
        }
        assert!(parse_header(&frame[..8]).expect("valid").is_some());
    }

    #[test]
    fn rejects_reserved_bits_and_opcodes() {
        assert_eq!(parse_header(&[0xc1, 0x00]), Err(FrameError::ReservedBits(0b100)));
        for opcode in [0x3u8, 0x7, 0xb, 0xf] {
            assert_eq!(
                parse_header(&[0x80 | opcode, 0x00]),
                Err(FrameError::ReservedOpcode(opcode))
            );
        }
    }

    #[test]
    fn rejects_fragmented_or_long_control_frames() {
        assert_eq!(parse_header(&[0x09, 0x00]), Err(FrameError::InvalidControl));
        assert_eq!(parse_header(&[0x89, 126, 0, 126]), Err(FrameError::InvalidControl));
    }
}
