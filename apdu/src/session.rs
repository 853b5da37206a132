// Copyright (c) 2023-2024 The calypso-tx Authors

//! Secure session open / close / abort APDUs
//!
//! ## Open-session response encoding:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              TRANSACTION_COUNTER              |  RATIFICATION |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      KIF      |      KVC      |    REC_LEN    |               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+               +
//! /                     RECORD_DATA (REC_LEN)                     /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `RECORD_DATA` is present when the opening was merged with a record
//! read, see the read-on-opening optimization in the engine.

use byteorder::{BigEndian, ByteOrder};
use num_enum::TryFromPrimitive;

use crate::params::{check_record_number, check_sfi};
use crate::{ApduError, ApduRequest, ApduResponse, CardCommand, Instruction, ParamError, StatusWord};

/// Terminal and card challenge length
pub const CHALLENGE_LEN: usize = 8;

/// Terminal and card session signature length
pub const SIGNATURE_LEN: usize = 8;

/// Session write-access level, doubling as the card key index
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, strum::Display, strum::EnumString, TryFromPrimitive,
)]
#[repr(u8)]
pub enum WriteAccessLevel {
    /// Issuer key, full personalization rights
    Personalization = 1,
    /// Load key, reload rights
    Load = 2,
    /// Debit key, debit rights
    Debit = 3,
}

/// OPEN SECURE SESSION request APDU
///
/// ## Encoding:
/// `CLA 8A P1 P2 08 challenge 00` with `P1 = rec<<3 | key index`,
/// `P2 = SFI<<3 | 1`; `rec`/`SFI` zero unless a read is merged into the
/// opening.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct OpenSession {
    level: WriteAccessLevel,
    sfi: u8,
    record: u8,
    challenge: [u8; CHALLENGE_LEN],
}

impl OpenSession {
    /// Open with no merged read
    pub fn new(level: WriteAccessLevel, challenge: [u8; CHALLENGE_LEN]) -> Self {
        Self {
            level,
            sfi: 0,
            record: 0,
            challenge,
        }
    }

    /// Open and read one record in the same exchange
    pub fn with_read(
        level: WriteAccessLevel,
        challenge: [u8; CHALLENGE_LEN],
        sfi: u8,
        record: u8,
    ) -> Result<Self, ParamError> {
        check_sfi(sfi)?;
        check_record_number(record)?;
        if record > 0x1F {
            // P1 leaves five bits for the merged record number
            return Err(ParamError::RecordNumber(record));
        }

        Ok(Self {
            level,
            sfi,
            record,
            challenge,
        })
    }

    /// Parse the opening response
    pub fn decode(&self, resp: &ApduResponse) -> Result<OpenSessionResponse, ApduError> {
        Self::check_status(resp)?;
        OpenSessionResponse::parse(&resp.data)
    }
}

impl CardCommand for OpenSession {
    const INS: Instruction = Instruction::OpenSession;

    fn request(&self, cla: u8) -> ApduRequest {
        ApduRequest {
            cla,
            ins: Self::INS,
            p1: (self.record << 3) | (self.level as u8),
            p2: (self.sfi << 3) | 0x01,
            data: self.challenge.to_vec(),
            le: Some(0x00),
        }
    }
}

/// Parsed open-session response
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OpenSessionResponse {
    /// Card session counter
    pub transaction_counter: u32,
    /// Whether the previous session was properly ratified
    pub previous_session_ratified: bool,
    /// Identifier of the key the card selected for this session
    pub kif: u8,
    /// Version of the key the card selected for this session
    pub kvc: u8,
    /// Content of the record merged into the opening, if any
    pub record_data: Vec<u8>,
}

impl OpenSessionResponse {
    /// Parse an open-session data-out blob, live or anticipated
    pub fn parse(data: &[u8]) -> Result<Self, ApduError> {
        if data.len() < 7 {
            return Err(ApduError::InvalidLength);
        }

        let ratification = match data[3] {
            0x00 => true,
            0x01 => false,
            _ => return Err(ApduError::InvalidEncoding),
        };

        let rec_len = data[6] as usize;
        if data.len() != 7 + rec_len {
            return Err(ApduError::InvalidLength);
        }

        Ok(Self {
            transaction_counter: BigEndian::read_u24(&data[0..3]),
            previous_session_ratified: ratification,
            kif: data[4],
            kvc: data[5],
            record_data: data[7..].to_vec(),
        })
    }
}

/// CLOSE SECURE SESSION request APDU
///
/// ## Encoding:
/// `CLA 8E P1 00 08 signature 00`, `P1 = 80` when immediate ratification
/// is requested; the response carries the card's 8-byte session signature.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CloseSession {
    signature: [u8; SIGNATURE_LEN],
    ratify_now: bool,
}

impl CloseSession {
    pub fn new(signature: [u8; SIGNATURE_LEN], ratify_now: bool) -> Self {
        Self {
            signature,
            ratify_now,
        }
    }

    /// Parse the card's session signature
    pub fn decode(&self, resp: &ApduResponse) -> Result<[u8; SIGNATURE_LEN], ApduError> {
        Self::check_status(resp)?;

        if resp.data.len() != SIGNATURE_LEN {
            return Err(ApduError::InvalidLength);
        }

        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&resp.data);
        Ok(sig)
    }
}

impl CardCommand for CloseSession {
    const INS: Instruction = Instruction::CloseSession;

    fn request(&self, cla: u8) -> ApduRequest {
        ApduRequest {
            cla,
            ins: Self::INS,
            p1: if self.ratify_now { 0x80 } else { 0x00 },
            p2: 0x00,
            data: self.signature.to_vec(),
            le: Some(0x00),
        }
    }
}

/// ABORT SECURE SESSION request APDU
///
/// A close with an empty body. Sent best-effort: a card with no session
/// open answers with a soft error, which is accepted so a desynchronized
/// card can always be reset.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct AbortSession;

impl AbortSession {
    pub fn decode(&self, resp: &ApduResponse) -> Result<(), ApduError> {
        Self::check_status(resp)
    }
}

impl CardCommand for AbortSession {
    const INS: Instruction = Instruction::CloseSession;

    fn request(&self, cla: u8) -> ApduRequest {
        ApduRequest {
            cla,
            ins: Self::INS,
            p1: 0x00,
            p2: 0x00,
            data: Vec::new(),
            le: None,
        }
    }

    fn accepts(sw: StatusWord) -> bool {
        sw.is_success()
            || sw == StatusWord::CONDITIONS_NOT_SATISFIED
            || sw == StatusWord::INCORRECT_SM_DATA
    }
}
