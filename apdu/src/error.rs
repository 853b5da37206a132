// Copyright (c) 2023-2024 The calypso-tx Authors

use crate::StatusWord;

/// Command encode / response decode errors
#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ApduError {
    /// Response payload shorter than the command's fixed layout
    #[error("response payload too short")]
    InvalidLength,

    /// Response payload present but malformed
    #[error("invalid response encoding")]
    InvalidEncoding,

    /// Status word outside the command's acceptance set
    #[error("unexpected status word {0}")]
    Status(StatusWord),

    /// Parameter rejected before encoding
    #[error(transparent)]
    Param(#[from] ParamError),
}

impl From<encdec::Error> for ApduError {
    fn from(e: encdec::Error) -> Self {
        match e {
            encdec::Error::Length => ApduError::InvalidLength,
            _ => ApduError::InvalidEncoding,
        }
    }
}

/// Out-of-range command parameters, rejected before any exchange
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ParamError {
    /// SFI outside [0, 30]
    #[error("SFI {0:#04x} out of range [0x00, 0x1e]")]
    Sfi(u8),

    /// Record number outside [1, 250]
    #[error("record number {0} out of range [1, 250]")]
    RecordNumber(u8),

    /// Record count of zero or running past record 250
    #[error("record count {0} invalid from record {1}")]
    RecordCount(u8, u8),

    /// Binary offset outside [0, 32767]
    #[error("binary offset {0} out of range [0, 32767]")]
    BinaryOffset(usize),

    /// In-record offset outside [0, 249]
    #[error("record offset {0} out of range [0, 249]")]
    RecordOffset(u8),

    /// Counter number outside [0, 83]
    #[error("counter number {0} out of range [0, 83]")]
    CounterNumber(u8),

    /// Counter operand outside [0, 0xFFFFFF]
    #[error("counter value {0} out of range [0, 16777215]")]
    CounterValue(u32),

    /// Record or binary data of invalid length
    #[error("data length {0} out of range [1, {1}]")]
    DataLength(usize, usize),

    /// Search data not in [1, 250] net of the offset
    #[error("search data length {0} out of range [1, {1}]")]
    SearchDataLength(usize, usize),

    /// Mask longer than the search data
    #[error("mask length {0} exceeds search data length {1}")]
    MaskLength(usize, usize),

    /// PIN not exactly 4 bytes
    #[error("PIN length {0}, expected 4")]
    PinLength(usize),

    /// Key index outside [1, 3]
    #[error("key index {0} out of range [1, 3]")]
    KeyIndex(u8),

    /// Stored value amount outside the operation's signed range
    #[error("stored value amount {0} out of range [{1}, {2}]")]
    SvAmount(i32, i32, i32),
}

