//! Robosen frame layout
//!
//! ```text
//! [0-1] : Header 0xFF 0xFF
//! [2]   : Length = payload length + 2 (covers opcode and checksum)
//! [3]   : Opcode
//! [4..] : Payload
//! [n]   : Checksum = (length + opcode + sum(payload)) mod 256
//! ```
//!
//! Notifications may split a frame or carry several back to back, so inbound
//! bytes go through [`FrameAssembler`] before decoding.

use crate::domain::error::ProtocolError;

pub const FRAME_HEADER: [u8; 2] = [0xFF, 0xFF];

/// Header, length and opcode plus the trailing checksum
pub const FRAME_OVERHEAD: usize = 5;

/// The length byte also counts opcode and checksum.
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize - 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

pub fn checksum(length: u8, opcode: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(length.wrapping_add(opcode), |acc, b| acc.wrapping_add(*b))
}

impl Frame {
    pub fn new(opcode: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::malformed(
                format!("payload of {} bytes does not fit a frame", payload.len()),
                payload,
            ));
        }
        Ok(Self {
            opcode,
            payload: payload.to_vec(),
        })
    }

    pub fn empty(opcode: u8) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // new() keeps payload.len() <= MAX_PAYLOAD_SIZE
        let length = (self.payload.len() + 2) as u8;
        let mut bytes = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        bytes.extend_from_slice(&FRAME_HEADER);
        bytes.push(length);
        bytes.push(self.opcode);
        bytes.extend_from_slice(&self.payload);
        bytes.push(checksum(length, self.opcode, &self.payload));
        bytes
    }

    /// Parse exactly one complete frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < FRAME_OVERHEAD - 1 {
            return Err(ProtocolError::malformed("frame too short", bytes));
        }
        if bytes[..2] != FRAME_HEADER {
            return Err(ProtocolError::malformed("missing 0xFFFF header", bytes));
        }

        let length = bytes[2];
        if length < 2 {
            return Err(ProtocolError::malformed(
                format!("length byte {length} is below the minimum of 2"),
                bytes,
            ));
        }
        let total = length as usize + 3;
        if bytes.len() != total {
            return Err(ProtocolError::malformed(
                format!("length byte says {} bytes, got {}", total, bytes.len()),
                bytes,
            ));
        }

        let opcode = bytes[3];
        let payload = &bytes[4..total - 1];
        let expected = checksum(length, opcode, payload);
        let actual = bytes[total - 1];
        if expected != actual {
            return Err(ProtocolError::malformed(
                format!("checksum {actual:#04X} != {expected:#04X}"),
                bytes,
            ));
        }

        Ok(Self {
            opcode,
            payload: payload.to_vec(),
        })
    }
}

/// Reassembles complete frames from notification chunks
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, or an error describing bytes that were discarded.
    ///
    /// Returns `None` once the buffer holds no further complete frame.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, ProtocolError>> {
        if self.buffer.len() < 2 {
            return None;
        }

        match self.buffer.windows(2).position(|w| w == FRAME_HEADER) {
            Some(0) => {}
            Some(start) => {
                let garbage: Vec<u8> = self.buffer.drain(..start).collect();
                return Some(Err(ProtocolError::malformed(
                    "bytes before frame header",
                    &garbage,
                )));
            }
            None => {
                // a trailing 0xFF may be the first half of the next header
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let cut = self.buffer.len() - keep;
                let garbage: Vec<u8> = self.buffer.drain(..cut).collect();
                return Some(Err(ProtocolError::malformed("no frame header", &garbage)));
            }
        }

        let length = *self.buffer.get(2)?;
        if length < 2 {
            let garbage: Vec<u8> = self.buffer.drain(..3).collect();
            return Some(Err(ProtocolError::malformed(
                format!("length byte {length} is below the minimum of 2"),
                &garbage,
            )));
        }

        let total = length as usize + 3;
        if self.buffer.len() < total {
            return None;
        }
        Some(Ok(self.buffer.drain(..total).collect()))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_matches_capture() {
        // reply to ENTER_BLUETOOTH_PROGRAMMING_MODE captured from a Grimlock
        let captured = [0xFF, 0xFF, 0x03, 0xE6, 0xE6, 0xCF];
        let frame = Frame::parse(&captured).unwrap();
        assert_eq!(frame.opcode, 0xE6);
        assert_eq!(frame.payload, vec![0xE6]);
        assert_eq!(frame.to_bytes(), captured.to_vec());
    }

    #[test]
    fn test_empty_payload_frame() {
        assert_eq!(Frame::empty(0x0F).to_bytes(), vec![0xFF, 0xFF, 0x02, 0x0F, 0x11]);
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let err = Frame::parse(&[0xFF, 0xFF, 0x02, 0x0F, 0x12]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload { .. }));
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let err = Frame::parse(&[0xFF, 0xFF, 0x04, 0x0F, 0x00, 0x13]).unwrap_err();
        match err {
            ProtocolError::MalformedPayload { raw, .. } => {
                assert_eq!(raw, vec![0xFF, 0xFF, 0x04, 0x0F, 0x00, 0x13])
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_missing_header() {
        assert!(Frame::parse(&[0xFE, 0xFF, 0x02, 0x0F, 0x11]).is_err());
        assert!(Frame::parse(&[0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_oversized_payload() {
        assert!(Frame::new(0xE8, &[0u8; MAX_PAYLOAD_SIZE]).is_ok());
        assert!(Frame::new(0xE8, &[0u8; MAX_PAYLOAD_SIZE + 1]).is_err());
    }

    #[test]
    fn test_assembler_joins_split_notifications() {
        let frame = Frame::new(0x0F, &[0x01, 0x55]).unwrap().to_bytes();
        let mut assembler = FrameAssembler::new();
        assembler.push(&frame[..3]);
        assert!(assembler.next_frame().is_none());
        assembler.push(&frame[3..]);
        assert_eq!(assembler.next_frame(), Some(Ok(frame)));
        assert!(assembler.next_frame().is_none());
    }

    #[test]
    fn test_assembler_splits_concatenated_frames() {
        let first = Frame::empty(0x0B).to_bytes();
        let second = Frame::new(0x11, &[0x64]).unwrap().to_bytes();
        let mut assembler = FrameAssembler::new();
        assembler.push(&[first.clone(), second.clone()].concat());
        assert_eq!(assembler.next_frame(), Some(Ok(first)));
        assert_eq!(assembler.next_frame(), Some(Ok(second)));
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_assembler_resyncs_after_garbage() {
        let frame = Frame::empty(0x0B).to_bytes();
        let mut assembler = FrameAssembler::new();
        assembler.push(&[0x01, 0x02]);
        assembler.push(&frame);

        match assembler.next_frame() {
            Some(Err(ProtocolError::MalformedPayload { raw, .. })) => {
                assert_eq!(raw, vec![0x01, 0x02])
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(assembler.next_frame(), Some(Ok(frame)));
    }

    #[test]
    fn test_assembler_keeps_half_header() {
        let mut assembler = FrameAssembler::new();
        assembler.push(&[0x10, 0x20, 0xFF]);
        assert!(matches!(assembler.next_frame(), Some(Err(_))));
        assert_eq!(assembler.buffered(), 1);
        assembler.push(&[0xFF, 0x02, 0x0B, 0x0D]);
        assert_eq!(
            assembler.next_frame(),
            Some(Ok(vec![0xFF, 0xFF, 0x02, 0x0B, 0x0D]))
        );
    }
}
