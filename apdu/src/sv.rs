// Copyright (c) 2023-2024 The calypso-tx Authors

//! Stored value APDUs: SV GET, SV RELOAD, SV DEBIT, SV UNDEBIT
//!
//! Balances and reload amounts are signed 24-bit big-endian; debit
//! amounts are signed 16-bit. SV GET returns the balance together with
//! the log record matching the requested variant; the modifying commands
//! return the new balance.

use encdec::{Decode, Encode};

use crate::error::ParamError;
use crate::helpers::*;
use crate::{ApduError, ApduRequest, ApduResponse, CardCommand, Instruction};

/// Stored value operations gated behind an SV GET
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::Display)]
pub enum SvOperation {
    Reload,
    Debit,
    Undebit,
}

impl SvOperation {
    /// The SV GET variant this operation must be preceded by
    pub fn get_variant(self) -> SvGetVariant {
        match self {
            SvOperation::Reload => SvGetVariant::Reload,
            SvOperation::Debit | SvOperation::Undebit => SvGetVariant::Debit,
        }
    }
}

/// SV GET variant selector, placed in P2
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::Display)]
#[repr(u8)]
pub enum SvGetVariant {
    Reload = 0x07,
    Debit = 0x09,
}

/// Stored value load log record
///
/// ## Encoding (22 bytes):
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |              DATE             |     FREE1     |      KVC      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     FREE2     |                    BALANCE                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     AMOUNT                    |      TIME     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |               ...TIME / SAM_ID (4B) / SAM_TNUM (3B)...        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |            SV_TNUM            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Debug, Encode, Decode)]
#[encdec(error = "ApduError")]
pub struct SvLoadLogRecord {
    #[encdec(with = "arr")]
    pub date: [u8; 2],
    pub free1: u8,
    pub kvc: u8,
    pub free2: u8,
    #[encdec(with = "i24")]
    pub balance: i32,
    #[encdec(with = "i24")]
    pub amount: i32,
    #[encdec(with = "arr")]
    pub time: [u8; 2],
    #[encdec(with = "arr")]
    pub sam_id: [u8; 4],
    #[encdec(with = "u24")]
    pub sam_tnum: u32,
    #[encdec(with = "u16be")]
    pub sv_tnum: u16,
}

/// Stored value debit log record
///
/// ## Encoding (20 bytes):
/// amount (2B), date (2B), time (2B), free (1B), KVC (1B), SAM_ID (4B),
/// SAM_TNUM (3B), balance (3B), SV_TNUM (2B)
#[derive(Copy, Clone, PartialEq, Eq, Debug, Encode, Decode)]
#[encdec(error = "ApduError")]
pub struct SvDebitLogRecord {
    #[encdec(with = "i16be")]
    pub amount: i16,
    #[encdec(with = "arr")]
    pub date: [u8; 2],
    #[encdec(with = "arr")]
    pub time: [u8; 2],
    pub free: u8,
    pub kvc: u8,
    #[encdec(with = "arr")]
    pub sam_id: [u8; 4],
    #[encdec(with = "u24")]
    pub sam_tnum: u32,
    #[encdec(with = "i24")]
    pub balance: i32,
    #[encdec(with = "u16be")]
    pub sv_tnum: u16,
}

/// Parsed SV GET response
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SvGetData {
    /// Current SV key version
    pub kvc: u8,
    /// Last SV transaction number
    pub tnum: u16,
    /// Current balance
    pub balance: i32,
    /// Last load, present for the reload variant
    pub load_log: Option<SvLoadLogRecord>,
    /// Last debit, present for the debit variant
    pub debit_log: Option<SvDebitLogRecord>,
}

/// SV GET request APDU
///
/// ## Encoding:
/// `CLA 7C 00 variant 00`
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SvGet {
    variant: SvGetVariant,
}

impl SvGet {
    pub fn new(variant: SvGetVariant) -> Self {
        Self { variant }
    }

    pub fn variant(&self) -> SvGetVariant {
        self.variant
    }

    /// Parse the balance and the variant's log record
    pub fn decode(&self, resp: &ApduResponse) -> Result<SvGetData, ApduError> {
        Self::check_status(resp)?;

        let data = &resp.data;
        if data.len() < 6 {
            return Err(ApduError::InvalidLength);
        }

        let kvc = data[0];
        let (tnum, _) = u16be::dec(&data[1..3])?;
        let (balance, _) = i24::dec(&data[3..6])?;

        let (load_log, debit_log) = match self.variant {
            SvGetVariant::Reload => {
                let (log, n) = SvLoadLogRecord::decode(&data[6..])?;
                if data.len() != 6 + n {
                    return Err(ApduError::InvalidLength);
                }
                (Some(log), None)
            }
            SvGetVariant::Debit => {
                let (log, n) = SvDebitLogRecord::decode(&data[6..])?;
                if data.len() != 6 + n {
                    return Err(ApduError::InvalidLength);
                }
                (None, Some(log))
            }
        };

        Ok(SvGetData {
            kvc,
            tnum,
            balance,
            load_log,
            debit_log,
        })
    }
}

impl CardCommand for SvGet {
    const INS: Instruction = Instruction::SvGet;

    fn request(&self, cla: u8) -> ApduRequest {
        ApduRequest {
            cla,
            ins: Self::INS,
            p1: 0x00,
            p2: self.variant as u8,
            data: Vec::new(),
            le: Some(0x00),
        }
    }
}

/// SV RELOAD request APDU
///
/// ## Encoding:
/// `CLA B8 00 00 09 [date free amount time] 03`, amount signed 24-bit;
/// the response carries the new 3-byte balance.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SvReload {
    amount: i32,
    date: [u8; 2],
    time: [u8; 2],
    free: [u8; 2],
}

impl SvReload {
    pub fn new(amount: i32, date: [u8; 2], time: [u8; 2], free: [u8; 2]) -> Result<Self, ParamError> {
        if !(-8_388_608..=8_388_607).contains(&amount) {
            return Err(ParamError::SvAmount(amount, -8_388_608, 8_388_607));
        }

        Ok(Self {
            amount,
            date,
            time,
            free,
        })
    }

    pub fn amount(&self) -> i32 {
        self.amount
    }

    pub fn date(&self) -> [u8; 2] {
        self.date
    }

    pub fn time(&self) -> [u8; 2] {
        self.time
    }

    pub fn free(&self) -> [u8; 2] {
        self.free
    }

    /// Parse the new balance
    pub fn decode(&self, resp: &ApduResponse) -> Result<i32, ApduError> {
        Self::check_status(resp)?;
        decode_balance(&resp.data)
    }
}

impl CardCommand for SvReload {
    const INS: Instruction = Instruction::SvReload;

    fn request(&self, cla: u8) -> ApduRequest {
        let mut data = Vec::with_capacity(9);
        data.extend_from_slice(&self.date);
        data.extend_from_slice(&self.free);
        let mut amt = [0u8; 3];
        i24::enc(&self.amount, &mut amt).expect("3-byte buffer");
        data.extend_from_slice(&amt);
        data.extend_from_slice(&self.time);

        ApduRequest {
            cla,
            ins: Self::INS,
            p1: 0x00,
            p2: 0x00,
            data,
            le: Some(0x03),
        }
    }
}

/// SV DEBIT / SV UNDEBIT request APDU
///
/// ## Encoding:
/// `CLA BA/BC 00 00 06 [amount date time] 03`, amount signed 16-bit
/// magnitude; the response carries the new 3-byte balance.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SvDebit {
    undebit: bool,
    amount: i16,
    date: [u8; 2],
    time: [u8; 2],
}

impl SvDebit {
    /// Debit `amount` units off the balance
    pub fn new(amount: i32, date: [u8; 2], time: [u8; 2]) -> Result<Self, ParamError> {
        Self::build(false, amount, date, time)
    }

    /// Reverse a previous debit of `amount` units
    pub fn undebit(amount: i32, date: [u8; 2], time: [u8; 2]) -> Result<Self, ParamError> {
        Self::build(true, amount, date, time)
    }

    fn build(undebit: bool, amount: i32, date: [u8; 2], time: [u8; 2]) -> Result<Self, ParamError> {
        if !(0..=32_767).contains(&amount) {
            return Err(ParamError::SvAmount(amount, 0, 32_767));
        }

        Ok(Self {
            undebit,
            amount: amount as i16,
            date,
            time,
        })
    }

    pub fn amount(&self) -> i32 {
        self.amount as i32
    }

    pub fn date(&self) -> [u8; 2] {
        self.date
    }

    pub fn time(&self) -> [u8; 2] {
        self.time
    }

    pub fn is_undebit(&self) -> bool {
        self.undebit
    }

    /// Parse the new balance
    pub fn decode(&self, resp: &ApduResponse) -> Result<i32, ApduError> {
        Self::check_status(resp)?;
        decode_balance(&resp.data)
    }
}

impl CardCommand for SvDebit {
    const INS: Instruction = Instruction::SvDebit;

    fn request(&self, cla: u8) -> ApduRequest {
        let ins = if self.undebit {
            Instruction::SvUndebit
        } else {
            Instruction::SvDebit
        };

        let mut data = Vec::with_capacity(6);
        let mut amt = [0u8; 2];
        i16be::enc(&self.amount, &mut amt).expect("2-byte buffer");
        data.extend_from_slice(&amt);
        data.extend_from_slice(&self.date);
        data.extend_from_slice(&self.time);

        ApduRequest {
            cla,
            ins,
            p1: 0x00,
            p2: 0x00,
            data,
            le: Some(0x03),
        }
    }
}

fn decode_balance(data: &[u8]) -> Result<i32, ApduError> {
    if data.len() != 3 {
        return Err(ApduError::InvalidLength);
    }
    Ok(i24::dec(data)?.0)
}
