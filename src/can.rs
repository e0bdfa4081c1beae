use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

/// Fixed identifier set. The DRS and fault identifiers come from the vehicle
/// network map; brake and wheel-speed telemetry use standard (11-bit) frames.
pub const CAN_ID_DRS_STATUS_TX: u32 = 0xAAAA1;
pub const CAN_ID_DRS_CONTROL_RX: u32 = 0xAAAA2;
pub const CAN_ID_DTC_TX: u32 = 0xBBBB0;
pub const CAN_ID_FAULT_TX: u32 = 0xBBBB1;
pub const CAN_ID_BRAKE_TELEM: u32 = 0x300;
pub const CAN_ID_WHEEL_SPEED_TELEM: u32 = 0x301;

pub const CAN_MAX_DLC: usize = 8;
/// 4-byte identifier word (bit 31 = extended flag) plus 1-byte DLC.
pub const CAN_HEADER_LEN: usize = 5;
pub const CAN_MAX_FRAME_LEN: usize = CAN_HEADER_LEN + CAN_MAX_DLC;

const EXTENDED_FLAG: u32 = 1 << 31;
const ID_MASK: u32 = 0x1fff_ffff;

const_assert_eq!(CAN_MAX_FRAME_LEN, 13);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CanError {
    #[error("data length code {0} exceeds 8")]
    DlcOutOfRange(u8),
    #[error("buffer truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("CAN device closed")]
    DeviceClosed,
    #[error("CAN device open failed")]
    OpenFailed,
    #[error("write backpressure")]
    Backpressure,
}

/// One CAN frame. Wire size depends on the declared data length code, so
/// frames on the byte stream are variable-length records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    dlc: u8,
    data: [u8; CAN_MAX_DLC],
}

impl CanFrame {
    /// Builds a frame, truncating the payload at 8 bytes.
    pub fn new(id: u32, extended: bool, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= CAN_MAX_DLC, "payload exceeds CAN DLC");
        let dlc = payload.len().min(CAN_MAX_DLC);
        let mut data = [0u8; CAN_MAX_DLC];
        data[..dlc].copy_from_slice(&payload[..dlc]);
        Self {
            id: id & ID_MASK,
            extended,
            dlc: dlc as u8,
            data,
        }
    }

    pub fn extended(id: u32, payload: &[u8]) -> Self {
        Self::new(id, true, payload)
    }

    pub fn standard(id: u32, payload: &[u8]) -> Self {
        Self::new(id, false, payload)
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        CAN_HEADER_LEN + self.dlc as usize
    }

    /// Encodes into `out`, returning the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CanError> {
        let need = self.wire_len();
        if out.len() < need {
            return Err(CanError::Truncated {
                need,
                have: out.len(),
            });
        }
        let mut word = self.id & ID_MASK;
        if self.extended {
            word |= EXTENDED_FLAG;
        }
        out[..4].copy_from_slice(&word.to_be_bytes());
        out[4] = self.dlc;
        out[CAN_HEADER_LEN..need].copy_from_slice(self.payload());
        Ok(need)
    }

    pub fn encode_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.wire_len()];
        // Infallible: the buffer is sized from wire_len.
        let _ = self.encode(&mut buf);
        buf
    }

    /// Decodes one frame from the front of `buf`, returning it along with
    /// the number of bytes consumed so a caller can walk a concatenated
    /// stream frame-by-frame.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CanError> {
        if buf.len() < CAN_HEADER_LEN {
            return Err(CanError::Truncated {
                need: CAN_HEADER_LEN,
                have: buf.len(),
            });
        }
        let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let dlc = buf[4];
        if dlc as usize > CAN_MAX_DLC {
            return Err(CanError::DlcOutOfRange(dlc));
        }
        let need = CAN_HEADER_LEN + dlc as usize;
        if buf.len() < need {
            return Err(CanError::Truncated {
                need,
                have: buf.len(),
            });
        }
        let frame = Self::new(
            word & ID_MASK,
            word & EXTENDED_FLAG != 0,
            &buf[CAN_HEADER_LEN..need],
        );
        Ok((frame, need))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_preserves_frame() {
        let frame = CanFrame::extended(CAN_ID_DRS_CONTROL_RX, &[1, 2, 3, 4]);
        let bytes = frame.encode_vec();
        assert_eq!(bytes.len(), CAN_HEADER_LEN + 4);
        let (decoded, used) = CanFrame::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, frame);
        assert!(decoded.extended);
    }

    #[test]
    fn zero_dlc_frame_is_header_only() {
        let frame = CanFrame::standard(CAN_ID_BRAKE_TELEM, &[]);
        assert_eq!(frame.wire_len(), CAN_HEADER_LEN);
        let (decoded, used) = CanFrame::decode(&frame.encode_vec()).unwrap();
        assert_eq!(used, CAN_HEADER_LEN);
        assert_eq!(decoded.payload(), &[] as &[u8]);
    }

    #[test]
    fn decode_rejects_bad_dlc() {
        let mut bytes = CanFrame::standard(0x100, &[0; 8]).encode_vec();
        bytes[4] = 9;
        assert_eq!(CanFrame::decode(&bytes), Err(CanError::DlcOutOfRange(9)));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let bytes = CanFrame::standard(0x100, &[1, 2, 3]).encode_vec();
        assert!(matches!(
            CanFrame::decode(&bytes[..bytes.len() - 1]),
            Err(CanError::Truncated { .. })
        ));
    }
}
