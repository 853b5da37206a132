// Copyright (c) 2023-2024 The calypso-tx Authors

//! Protocol / APDU definitions for Calypso card communication
//!
//! This crate provides the command catalog for the Calypso transaction
//! engine: one module per command group, each a pure encode/decode pair.
//! Encoding validates parameters up front and produces an [`ApduRequest`];
//! decoding validates the trailing status word and yields typed payloads
//! for the engine to fold into its card image.
//!
//! Commands carry no I/O and no card state, so everything here is usable
//! from unit tests with nothing but byte fixtures.

pub mod binary;
pub mod counters;
pub mod invalidate;
pub mod key;
pub mod pin;
pub mod records;
pub mod search;
pub mod select;
pub mod session;
pub mod status;
pub mod sv;

mod error;
pub use error::{ApduError, ParamError};

pub mod params;

mod helpers;

pub use status::StatusWord;

/// ISO class byte used by Prime revision 3 and Light products
pub const CLA_ISO: u8 = 0x00;

/// Legacy class byte used by Prime revision 2 products
pub const CLA_LEGACY: u8 = 0x94;

/// Calypso instruction codes
///
/// CHANGE PIN and CHANGE KEY share an instruction byte and are told apart
/// by P2 (`0xFF` for PIN, the key index otherwise), so instruction values
/// are exposed through [`Instruction::ins`] rather than enum discriminants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum Instruction {
    /// Select a file by LID or navigation control
    SelectFile,
    /// Fetch a data object (FCP, EF list, traceability information)
    GetData,
    /// Read one or several full records
    ReadRecords,
    /// Read the same byte range out of several records
    ReadRecordsPartially,
    /// Replace a record's content
    UpdateRecord,
    /// OR-write a record's content
    WriteRecord,
    /// Read a byte range of a binary file
    ReadBinary,
    /// Replace a byte range of a binary file
    UpdateBinary,
    /// OR-write a byte range of a binary file
    WriteBinary,
    /// Add to a single counter
    Increase,
    /// Subtract from a single counter
    Decrease,
    /// Add to several counters in one exchange
    IncreaseMultiple,
    /// Subtract from several counters in one exchange
    DecreaseMultiple,
    /// Search records for a masked pattern
    SearchRecords,
    /// Fetch a card challenge
    GetChallenge,
    /// Present the PIN, or query its status when sent without data
    VerifyPin,
    /// Replace the PIN
    ChangePin,
    /// Replace a session key
    ChangeKey,
    /// Open a secure session
    OpenSession,
    /// Close (or abort, when sent without data) a secure session
    CloseSession,
    /// Invalidate the application
    Invalidate,
    /// Rehabilitate an invalidated application
    Rehabilitate,
    /// Read the stored value balance and log
    SvGet,
    /// Add to the stored value balance
    SvReload,
    /// Subtract from the stored value balance
    SvDebit,
    /// Reverse a previous stored value debit
    SvUndebit,
}

impl Instruction {
    /// Instruction byte placed in the APDU header
    pub const fn ins(self) -> u8 {
        match self {
            Instruction::SelectFile => 0xA4,
            Instruction::GetData => 0xCA,
            Instruction::ReadRecords => 0xB2,
            Instruction::ReadRecordsPartially => 0xB3,
            Instruction::UpdateRecord => 0xDC,
            Instruction::WriteRecord => 0xD2,
            Instruction::ReadBinary => 0xB0,
            Instruction::UpdateBinary => 0xD6,
            Instruction::WriteBinary => 0xD0,
            Instruction::Increase => 0x32,
            Instruction::Decrease => 0x30,
            Instruction::IncreaseMultiple => 0x3A,
            Instruction::DecreaseMultiple => 0x38,
            Instruction::SearchRecords => 0xA2,
            Instruction::GetChallenge => 0x84,
            Instruction::VerifyPin => 0x20,
            Instruction::ChangePin => 0xD8,
            Instruction::ChangeKey => 0xD8,
            Instruction::OpenSession => 0x8A,
            Instruction::CloseSession => 0x8E,
            Instruction::Invalidate => 0x04,
            Instruction::Rehabilitate => 0x44,
            Instruction::SvGet => 0x7C,
            Instruction::SvReload => 0xB8,
            Instruction::SvDebit => 0xBA,
            Instruction::SvUndebit => 0xBC,
        }
    }
}

/// A command APDU ready for transmission
///
/// `data` and `le` drive the ISO 7816-4 short encoding cases: header only,
/// header + Le, header + Lc + data, or header + Lc + data + Le.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ApduRequest {
    pub cla: u8,
    pub ins: Instruction,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u8>,
}

impl ApduRequest {
    /// Raw bytes as sent to the reader
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins.ins(), self.p1, self.p2]);
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            out.push(le);
        }
        out
    }

    /// Payload footprint of this command: outgoing data plus expected
    /// response bytes. The batcher packs exchanges against this figure.
    pub fn body_len(&self) -> usize {
        self.data.len() + self.le.map(usize::from).unwrap_or(0)
    }
}

/// A response APDU split into payload and status word
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw: StatusWord,
}

impl ApduResponse {
    /// Split a raw reader buffer into payload and trailing status word
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ApduError> {
        if raw.len() < 2 {
            return Err(ApduError::InvalidLength);
        }
        let (data, trailer) = raw.split_at(raw.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            sw: StatusWord(u16::from_be_bytes([trailer[0], trailer[1]])),
        })
    }

    /// Reassemble the raw byte form, payload plus status word
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.sw.0.to_be_bytes());
        out
    }

    /// Build a response from payload bytes and a status word value
    pub fn new(data: impl Into<Vec<u8>>, sw: u16) -> Self {
        Self {
            data: data.into(),
            sw: StatusWord(sw),
        }
    }
}

/// Common surface of every catalog command
///
/// `accepts` captures the per-command status-word acceptance set: `9000`
/// by default, widened by commands with documented soft codes (search,
/// partial reads, PIN status, session abort).
pub trait CardCommand {
    /// Instruction this command encodes to
    const INS: Instruction;

    /// Build the request APDU under the given class byte
    fn request(&self, cla: u8) -> ApduRequest;

    /// Whether a status word is acceptable for this command
    fn accepts(sw: StatusWord) -> bool {
        sw.is_success()
    }

    /// Validate a response's status word against the acceptance set
    fn check_status(resp: &ApduResponse) -> Result<(), ApduError> {
        if Self::accepts(resp.sw) {
            Ok(())
        } else {
            Err(ApduError::Status(resp.sw))
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Helper asserting a request encodes to an exact byte vector
    pub fn assert_request<C: CardCommand>(cmd: &C, cla: u8, expect_hex: &str) {
        let apdu = cmd.request(cla);
        assert_eq!(
            hex::encode(apdu.to_bytes()),
            expect_hex,
            "request encoding mismatch for {}",
            C::INS
        );
    }
}
