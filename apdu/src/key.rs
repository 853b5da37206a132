// Copyright (c) 2023-2024 The calypso-tx Authors

//! CHANGE KEY APDU
//!
//! Shares its instruction byte with CHANGE PIN; P2 carries the key index
//! instead of `0xFF`.

use crate::error::ParamError;
use crate::{ApduError, ApduRequest, ApduResponse, CardCommand, Instruction};

/// Ciphered key block length
pub const KEY_CRYPTOGRAM_LEN: usize = 24;

/// Key reference, identifier plus version
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct KeyRef {
    pub kif: u8,
    pub kvc: u8,
}

impl KeyRef {
    pub fn new(kif: u8, kvc: u8) -> Self {
        Self { kif, kvc }
    }
}

/// CHANGE KEY request APDU
///
/// ## Encoding:
/// `CLA D8 00 keyIndex 18 cryptogram`
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChangeKey {
    key_index: u8,
    cryptogram: Vec<u8>,
}

impl ChangeKey {
    pub fn new(key_index: u8, cryptogram: Vec<u8>) -> Result<Self, ParamError> {
        if !(1..=3).contains(&key_index) {
            return Err(ParamError::KeyIndex(key_index));
        }
        if cryptogram.len() != KEY_CRYPTOGRAM_LEN {
            return Err(ParamError::DataLength(cryptogram.len(), KEY_CRYPTOGRAM_LEN));
        }

        Ok(Self {
            key_index,
            cryptogram,
        })
    }

    pub fn decode(&self, resp: &ApduResponse) -> Result<(), ApduError> {
        Self::check_status(resp)
    }
}

impl CardCommand for ChangeKey {
    const INS: Instruction = Instruction::ChangeKey;

    fn request(&self, cla: u8) -> ApduRequest {
        ApduRequest {
            cla,
            ins: Self::INS,
            p1: 0x00,
            p2: self.key_index,
            data: self.cryptogram.clone(),
            le: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::assert_request;

    #[test]
    fn change_key() {
        let cmd = ChangeKey::new(2, vec![0x5A; 24]).unwrap();
        assert_request(
            &cmd,
            0x00,
            "00d80002185a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a",
        );
    }

    #[test]
    fn key_index_enforced() {
        assert_eq!(
            ChangeKey::new(0, vec![0x00; 24]).unwrap_err(),
            ParamError::KeyIndex(0)
        );
        assert_eq!(
            ChangeKey::new(4, vec![0x00; 24]).unwrap_err(),
            ParamError::KeyIndex(4)
        );
    }

    #[test]
    fn cryptogram_length_enforced() {
        assert_eq!(
            ChangeKey::new(1, vec![0x00; 16]).unwrap_err(),
            ParamError::DataLength(16, KEY_CRYPTOGRAM_LEN)
        );
    }
}
