// Copyright (c) 2023-2024 The calypso-tx Authors

//! Application invalidate / rehabilitate APDUs
//!
//! Both are header-only commands; the engine rejects them without an
//! exchange when the card is already in the target validity state.

use crate::{ApduError, ApduRequest, ApduResponse, CardCommand, Instruction};

/// INVALIDATE request APDU
///
/// ## Encoding:
/// `CLA 04 00 00`
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Invalidate;

impl Invalidate {
    pub fn decode(&self, resp: &ApduResponse) -> Result<(), ApduError> {
        Self::check_status(resp)
    }
}

impl CardCommand for Invalidate {
    const INS: Instruction = Instruction::Invalidate;

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
}

/// REHABILITATE request APDU
///
/// ## Encoding:
/// `CLA 44 00 00`
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Rehabilitate;

impl Rehabilitate {
    pub fn decode(&self, resp: &ApduResponse) -> Result<(), ApduError> {
        Self::check_status(resp)
    }
}

impl CardCommand for Rehabilitate {
    const INS: Instruction = Instruction::Rehabilitate;

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
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::assert_request;

    #[test]
    fn invalidate() {
        assert_request(&Invalidate, 0x00, "00040000");
    }

    #[test]
    fn rehabilitate() {
        assert_request(&Rehabilitate, 0x00, "00440000");
    }
}
