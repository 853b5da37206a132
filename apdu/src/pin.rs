// Copyright (c) 2023-2024 The calypso-tx Authors

//! PIN presentation / modification APDUs and the card challenge fetch
//!
//! Plaintext PIN transmission is opt-in at the engine level; the ciphered
//! forms carry material produced by the crypto module against a fresh
//! card challenge.

use zeroize::Zeroize;

use crate::error::ParamError;
use crate::session::CHALLENGE_LEN;
use crate::{ApduError, ApduRequest, ApduResponse, CardCommand, Instruction, StatusWord};

/// Plaintext PIN length
pub const PIN_LEN: usize = 4;

/// Ciphered PIN presentation block length
pub const CIPHERED_PIN_LEN: usize = 8;

/// Ciphered PIN modification block length
pub const CIPHERED_PIN_CHANGE_LEN: usize = 16;

/// A plaintext PIN, wiped on drop and masked in debug output
#[derive(Clone, PartialEq, Eq)]
pub struct PinData([u8; PIN_LEN]);

impl PinData {
    pub fn new(pin: &[u8]) -> Result<Self, ParamError> {
        if pin.len() != PIN_LEN {
            return Err(ParamError::PinLength(pin.len()));
        }

        let mut d = [0u8; PIN_LEN];
        d.copy_from_slice(pin);
        Ok(Self(d))
    }

    pub fn as_bytes(&self) -> &[u8; PIN_LEN] {
        &self.0
    }
}

impl Drop for PinData {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl core::fmt::Debug for PinData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PinData(****)")
    }
}

/// GET CHALLENGE request APDU
///
/// ## Encoding:
/// `CLA 84 00 00 08`
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct GetChallenge;

impl GetChallenge {
    /// Parse the card challenge
    pub fn decode(&self, resp: &ApduResponse) -> Result<[u8; CHALLENGE_LEN], ApduError> {
        Self::check_status(resp)?;

        if resp.data.len() != CHALLENGE_LEN {
            return Err(ApduError::InvalidLength);
        }

        let mut c = [0u8; CHALLENGE_LEN];
        c.copy_from_slice(&resp.data);
        Ok(c)
    }
}

impl CardCommand for GetChallenge {
    const INS: Instruction = Instruction::GetChallenge;

    fn request(&self, cla: u8) -> ApduRequest {
        ApduRequest {
            cla,
            ins: Self::INS,
            p1: 0x00,
            p2: 0x00,
            data: Vec::new(),
            le: Some(CHALLENGE_LEN as u8),
        }
    }
}

/// VERIFY PIN request APDU
///
/// ## Encoding:
/// `CLA 20 00 00 04 pin` (plaintext), `CLA 20 00 00 08 block` (ciphered),
/// or `CLA 20 00 00` with no data to query the presentation status.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum VerifyPin {
    Plain(PinData),
    Ciphered([u8; CIPHERED_PIN_LEN]),
    Status,
}

/// Outcome of a PIN presentation or status query
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PinStatus {
    /// PIN verified, or status query with no failed attempts outstanding
    Validated,
    /// Remaining presentation attempts
    AttemptsRemaining(u8),
    /// PIN blocked
    Blocked,
}

impl VerifyPin {
    /// Parse the presentation outcome; attempt exhaustion is status, not
    /// an error
    pub fn decode(&self, resp: &ApduResponse) -> Result<PinStatus, ApduError> {
        Self::check_status(resp)?;

        if resp.sw.is_success() {
            Ok(PinStatus::Validated)
        } else if let Some(n) = resp.sw.pin_attempts() {
            Ok(PinStatus::AttemptsRemaining(n))
        } else {
            Ok(PinStatus::Blocked)
        }
    }
}

impl CardCommand for VerifyPin {
    const INS: Instruction = Instruction::VerifyPin;

    fn request(&self, cla: u8) -> ApduRequest {
        let data = match self {
            VerifyPin::Plain(pin) => pin.as_bytes().to_vec(),
            VerifyPin::Ciphered(block) => block.to_vec(),
            VerifyPin::Status => Vec::new(),
        };

        ApduRequest {
            cla,
            ins: Self::INS,
            p1: 0x00,
            p2: 0x00,
            data,
            le: None,
        }
    }

    fn accepts(sw: StatusWord) -> bool {
        sw.is_success() || sw.pin_attempts().is_some() || sw == StatusWord::PIN_BLOCKED
    }
}

/// CHANGE PIN request APDU
///
/// ## Encoding:
/// `CLA D8 00 FF 04 pin` (plaintext) or `CLA D8 00 FF 10 block`
/// (ciphered).
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ChangePin {
    Plain(PinData),
    Ciphered([u8; CIPHERED_PIN_CHANGE_LEN]),
}

impl ChangePin {
    pub fn decode(&self, resp: &ApduResponse) -> Result<(), ApduError> {
        Self::check_status(resp)
    }
}

impl CardCommand for ChangePin {
    const INS: Instruction = Instruction::ChangePin;

    fn request(&self, cla: u8) -> ApduRequest {
        let data = match self {
            ChangePin::Plain(pin) => pin.as_bytes().to_vec(),
            ChangePin::Ciphered(block) => block.to_vec(),
        };

        ApduRequest {
            cla,
            ins: Self::INS,
            p1: 0x00,
            p2: 0xFF,
            data,
            le: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::assert_request;

    #[test]
    fn get_challenge() {
        assert_request(&GetChallenge, 0x00, "0084000008");
    }

    #[test]
    fn verify_plain() {
        let cmd = VerifyPin::Plain(PinData::new(b"1234").unwrap());
        assert_request(&cmd, 0x00, "002000000431323334");
    }

    #[test]
    fn verify_ciphered() {
        let cmd = VerifyPin::Ciphered([0xC1; 8]);
        assert_request(&cmd, 0x00, "0020000008c1c1c1c1c1c1c1c1");
    }

    #[test]
    fn status_query_has_no_body() {
        assert_request(&VerifyPin::Status, 0x00, "00200000");
    }

    #[test]
    fn status_decode() {
        let cmd = VerifyPin::Status;
        assert_eq!(
            cmd.decode(&ApduResponse::new(vec![], 0x9000)).unwrap(),
            PinStatus::Validated
        );
        assert_eq!(
            cmd.decode(&ApduResponse::new(vec![], 0x63C2)).unwrap(),
            PinStatus::AttemptsRemaining(2)
        );
        assert_eq!(
            cmd.decode(&ApduResponse::new(vec![], 0x6983)).unwrap(),
            PinStatus::Blocked
        );
        assert!(cmd.decode(&ApduResponse::new(vec![], 0x6A82)).is_err());
    }

    #[test]
    fn change_plain() {
        let cmd = ChangePin::Plain(PinData::new(b"0000").unwrap());
        assert_request(&cmd, 0x00, "00d800ff0430303030");
    }

    #[test]
    fn change_ciphered() {
        let cmd = ChangePin::Ciphered([0xD2; 16]);
        assert_request(&cmd, 0x00, "00d800ff10d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2");
    }

    #[test]
    fn pin_length_enforced() {
        assert_eq!(PinData::new(b"12345").unwrap_err(), ParamError::PinLength(5));
    }

    #[test]
    fn pin_debug_is_masked() {
        let pin = PinData::new(b"1234").unwrap();
        assert_eq!(format!("{pin:?}"), "PinData(****)");
    }
}
