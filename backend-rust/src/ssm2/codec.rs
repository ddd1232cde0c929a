//! SSM2 wire framing: checksum, frame construction, and the resync parser.

pub const HEADER: u8 = 0x80;
pub const TESTER_ADDR: u8 = 0xF0;

/// Low byte of the sum of all preceding bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

pub fn build_frame(dst: u8, src: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len() + 1);
    buf.push(HEADER);
    buf.push(dst);
    buf.push(src);
    buf.push(payload.len() as u8);
    buf.extend_from_slice(payload);
    let cksum = checksum(&buf);
    buf.push(cksum);
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub dst: u8,
    pub src: u8,
    pub payload: Vec<u8>,
}

/// Result of one scan over the rolling receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameScan {
    /// Buffer holds a prefix of a frame; wait for more bytes.
    NeedMoreData,
    /// Drop `n` leading bytes and scan again. `mismatch` is true only when a
    /// full candidate frame was seen and its checksum failed to validate.
    Drop { n: usize, mismatch: bool },
    /// A checksum-valid frame was found; consume `consumed` bytes.
    Frame { consumed: usize, frame: ParsedFrame },
}

/// Scans `buf` for the next valid frame, resyncing past garbage and
/// checksum failures one byte at a time.
pub fn scan(buf: &[u8]) -> FrameScan {
    if buf.is_empty() {
        return FrameScan::NeedMoreData;
    }
    let idx = match buf.iter().position(|&b| b == HEADER) {
        Some(idx) => idx,
        None => return FrameScan::Drop { n: buf.len(), mismatch: false },
    };
    if idx > 0 {
        return FrameScan::Drop { n: idx, mismatch: false };
    }
    if buf.len() < 4 {
        return FrameScan::NeedMoreData;
    }
    let len = buf[3] as usize;
    let total = 4 + len + 1;
    if buf.len() < total {
        return FrameScan::NeedMoreData;
    }
    let calc = checksum(&buf[0..4 + len]);
    if calc == buf[4 + len] {
        FrameScan::Frame {
            consumed: total,
            frame: ParsedFrame {
                dst: buf[1],
                src: buf[2],
                payload: buf[4..4 + len].to_vec(),
            },
        }
    } else {
        FrameScan::Drop { n: 1, mismatch: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_frame_roundtrip() {
        let payload = vec![0xBF];
        let frame = build_frame(0x10, TESTER_ADDR, &payload);
        match scan(&frame) {
            FrameScan::Frame { consumed, frame: parsed } => {
                assert_eq!(consumed, frame.len());
                assert_eq!(parsed.dst, 0x10);
                assert_eq!(parsed.src, TESTER_ADDR);
                assert_eq!(parsed.payload, payload);
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    #[test]
    fn test_roundtrip_all_payload_lengths() {
        for len in [0usize, 1, 32, 128, 255] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let frame = build_frame(0xF0, 0x10, &payload);
            match scan(&frame) {
                FrameScan::Frame { frame: parsed, .. } => assert_eq!(parsed.payload, payload),
                other => panic!("len {len}: expected Frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_garbage_prefix_resyncs() {
        let mut buf = vec![0x01, 0x02, 0x03, 0x80, 0x80];
        let frame = build_frame(0xF0, 0x10, &[0xAA]);
        buf.extend_from_slice(&frame);
        let mut total_dropped = 0;
        loop {
            match scan(&buf[total_dropped..]) {
                FrameScan::Drop { n, .. } => total_dropped += n,
                FrameScan::Frame { frame: parsed, .. } => {
                    assert_eq!(parsed.payload, vec![0xAA]);
                    return;
                }
                FrameScan::NeedMoreData => panic!("ran out of data before finding frame"),
            }
        }
    }

    #[test]
    fn test_checksum_mismatch_resyncs_one_byte() {
        let mut frame = build_frame(0xF0, 0x10, &[0x01, 0x02]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        match scan(&frame) {
            FrameScan::Drop { n, mismatch } => {
                assert_eq!(n, 1);
                assert!(mismatch);
            }
            other => panic!("expected mismatch drop, got {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_frame_needs_more_data() {
        let frame = build_frame(0xF0, 0x10, &[0x01, 0x02, 0x03]);
        assert_eq!(scan(&frame[..2]), FrameScan::NeedMoreData);
    }
}
