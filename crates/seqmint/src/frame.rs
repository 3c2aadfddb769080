//! # Wire frame codec
//!
//! Every datagram exchanged between clients, agents and masters is one fixed
//! 30-byte frame. All multi-byte integers are network byte order:
//!
//! ```text
//! offset  0        1        2     4     6      10      14      18      26
//!         +--------+--------+-----+-----+------+-------+-------+-------+-------+
//!         | major  | minor  | len | typ | echo | value1| value2| value3| magic |
//!         |  u8    |  u8    | u16 | u16 | u32  |  u32  |  u32  |  u64  |  u32  |
//!         +--------+--------+-----+-----+------+-------+-------+-------+-------+
//! ```
//!
//! Requests carry no variable-length payload; any datagram that is not
//! exactly [`FRAME_LEN`] bytes, disagrees with its own `len` field, carries a
//! foreign major version, or fails the magic check is dropped without a
//! reply.
//!
//! The `magic` field is a cheap corruption/tamper detector, not a MAC: the
//! absolute difference between `value3` and the sum of every other field,
//! truncated to `u32`. Both ends of the protocol compute the same function.

use thiserror::Error;

/// Size of every frame on the wire.
pub const FRAME_LEN: usize = 30;

/// Protocol major version. Frames with a different major version are dropped.
pub const MAJOR_VERSION: u8 = 0;

/// Protocol minor version. Informational; not checked on receive.
pub const MINOR_VERSION: u8 = 4;

/// Message type codes. The numeric values are the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    /// Lease or renew a machine label (client→agent, agent→master).
    RequestLabel = 1,
    /// Carries a label in `value1` (agent→client, master→agent).
    ResponseLabel = 2,
    /// Mint one packed id; `value1` = user prefix, `value3` = caller seconds.
    RequestUniqId = 3,
    /// Carries the packed id in `value3`.
    ResponseUniqId = 4,
    /// Allocate `value1` (as u16, 0 means 1) raw sequence values.
    RequestUniqSeq = 5,
    /// Carries the starting sequence in `value1`.
    ResponseUniqSeq = 6,
    /// Allocate `value1` sequence values and report the label with them.
    RequestLabelAndSeq = 7,
    /// Carries the label in `value1` and the starting sequence in `value2`.
    ResponseLabelAndSeq = 8,
    /// Carries an [`ErrCode`](crate::ErrCode) in `value1`.
    ResponseError = 9,
}

impl MsgType {
    pub const fn code(self) -> u16 {
        self as u16
    }

    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::RequestLabel),
            2 => Some(Self::ResponseLabel),
            3 => Some(Self::RequestUniqId),
            4 => Some(Self::ResponseUniqId),
            5 => Some(Self::RequestUniqSeq),
            6 => Some(Self::ResponseUniqSeq),
            7 => Some(Self::RequestLabelAndSeq),
            8 => Some(Self::ResponseLabelAndSeq),
            9 => Some(Self::ResponseError),
            _ => None,
        }
    }
}

/// Reasons a datagram failed to decode. All of them mean "drop silently" at
/// the receiving end; the variants exist so the drop can be logged and, at
/// the client, counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("datagram is {got} bytes, frame is {FRAME_LEN}")]
    SizeMismatch { got: usize },
    #[error("len field {len} disagrees with datagram size")]
    LenFieldMismatch { len: u16 },
    #[error("major version {got} is not {MAJOR_VERSION}")]
    VersionMismatch { got: u8 },
    #[error("magic {got} does not match computed {want}")]
    BadMagic { got: u32, want: u32 },
}

/// One decoded (or to-be-encoded) wire frame.
///
/// `kind` stays a raw `u16` here: a well-formed frame with an unknown type
/// must reach the dispatcher so it can answer `INVALID_TYPE` instead of
/// silently dropping it. Use [`MsgType::from_code`] to classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub major_ver: u8,
    pub minor_ver: u8,
    pub len: u16,
    pub kind: u16,
    pub echo: u32,
    pub value1: u32,
    pub value2: u32,
    pub value3: u64,
    pub magic: u32,
}

impl Frame {
    /// Builds a frame of the given type with current protocol versions, the
    /// correct `len`, and a valid magic.
    pub fn new(kind: MsgType, echo: u32, value1: u32, value2: u32, value3: u64) -> Self {
        let mut frame = Self {
            major_ver: MAJOR_VERSION,
            minor_ver: MINOR_VERSION,
            len: FRAME_LEN as u16,
            kind: kind.code(),
            echo,
            value1,
            value2,
            value3,
            magic: 0,
        };
        frame.update_magic();
        frame
    }

    /// Computes the magic for the current field values.
    pub const fn calc_magic(&self) -> u32 {
        let sum = self.major_ver as u64
            + self.minor_ver as u64
            + self.len as u64
            + self.kind as u64
            + self.echo as u64
            + self.value1 as u64
            + self.value2 as u64;
        self.value3.abs_diff(sum) as u32
    }

    /// Recomputes `magic` from the other fields. Must be called after any
    /// field mutation and before encoding.
    pub const fn update_magic(&mut self) {
        self.magic = self.calc_magic();
    }

    pub const fn valid_magic(&self) -> bool {
        self.magic == self.calc_magic()
    }

    /// Serializes the frame in network byte order.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = self.major_ver;
        buf[1] = self.minor_ver;
        buf[2..4].copy_from_slice(&self.len.to_be_bytes());
        buf[4..6].copy_from_slice(&self.kind.to_be_bytes());
        buf[6..10].copy_from_slice(&self.echo.to_be_bytes());
        buf[10..14].copy_from_slice(&self.value1.to_be_bytes());
        buf[14..18].copy_from_slice(&self.value2.to_be_bytes());
        buf[18..26].copy_from_slice(&self.value3.to_be_bytes());
        buf[26..30].copy_from_slice(&self.magic.to_be_bytes());
        buf
    }

    /// Deserializes and validates one datagram.
    ///
    /// # Errors
    ///
    /// Any [`FrameError`]; the caller drops the datagram in every case.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() != FRAME_LEN {
            return Err(FrameError::SizeMismatch { got: buf.len() });
        }
        let frame = Self {
            major_ver: buf[0],
            minor_ver: buf[1],
            len: u16::from_be_bytes([buf[2], buf[3]]),
            kind: u16::from_be_bytes([buf[4], buf[5]]),
            echo: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            value1: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
            value2: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
            value3: u64::from_be_bytes([
                buf[18], buf[19], buf[20], buf[21], buf[22], buf[23], buf[24], buf[25],
            ]),
            magic: u32::from_be_bytes([buf[26], buf[27], buf[28], buf[29]]),
        };
        if frame.len as usize != buf.len() {
            return Err(FrameError::LenFieldMismatch { len: frame.len });
        }
        if frame.major_ver != MAJOR_VERSION {
            return Err(FrameError::VersionMismatch {
                got: frame.major_ver,
            });
        }
        if !frame.valid_magic() {
            return Err(FrameError::BadMagic {
                got: frame.magic,
                want: frame.calc_magic(),
            });
        }
        Ok(frame)
    }
}
