// Copyright (c) 2023-2024 The calypso-tx Authors

//! Counter increase / decrease APDUs, single and multiple
//!
//! Counter operands and results are 3-byte big-endian values. The
//! multiple variants carry `(counter, value)` tuples of four bytes each
//! and are only available on products advertising the feature; the
//! batcher expands them into single-counter exchanges elsewhere.

use byteorder::{BigEndian, ByteOrder};

use crate::params::{check_counter_number, check_counter_value, check_sfi};
use crate::{ApduError, ApduRequest, ApduResponse, CardCommand, Instruction, ParamError};

/// Direction of a counter adjustment
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::Display)]
pub enum CounterDirection {
    Increase,
    Decrease,
}

/// INCREASE / DECREASE request APDU for a single counter
///
/// ## Encoding:
/// `CLA 32/30 counter P2 03 value` with `P2 = SFI<<3`, value 3-byte
/// big-endian; the response carries the new 3-byte counter value.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AdjustCounter {
    direction: CounterDirection,
    sfi: u8,
    counter: u8,
    value: u32,
}

impl AdjustCounter {
    pub fn new(
        direction: CounterDirection,
        sfi: u8,
        counter: u8,
        value: u32,
    ) -> Result<Self, ParamError> {
        check_sfi(sfi)?;
        check_counter_number(counter)?;
        check_counter_value(value)?;

        Ok(Self {
            direction,
            sfi,
            counter,
            value,
        })
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    /// Parse the new counter value from the response
    pub fn decode(&self, resp: &ApduResponse) -> Result<u32, ApduError> {
        Self::check_status(resp)?;

        if resp.data.len() != 3 {
            return Err(ApduError::InvalidLength);
        }

        Ok(BigEndian::read_u24(&resp.data))
    }
}

impl CardCommand for AdjustCounter {
    // The direction picks the actual instruction byte in `request`
    const INS: Instruction = Instruction::Increase;

    fn request(&self, cla: u8) -> ApduRequest {
        let ins = match self.direction {
            CounterDirection::Increase => Instruction::Increase,
            CounterDirection::Decrease => Instruction::Decrease,
        };

        let mut data = vec![0u8; 3];
        BigEndian::write_u24(&mut data, self.value);

        ApduRequest {
            cla,
            ins,
            p1: self.counter,
            p2: self.sfi << 3,
            data,
            le: None,
        }
    }
}

/// INCREASE MULTIPLE / DECREASE MULTIPLE request APDU
///
/// ## Encoding:
/// `CLA 3A/38 00 P2 Lc (counter, value)*` with `P2 = SFI<<3`; the
/// response repeats `(counter, new value)` tuples in request order.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AdjustCounters {
    direction: CounterDirection,
    sfi: u8,
    items: Vec<(u8, u32)>,
}

impl AdjustCounters {
    pub fn new(
        direction: CounterDirection,
        sfi: u8,
        items: Vec<(u8, u32)>,
    ) -> Result<Self, ParamError> {
        check_sfi(sfi)?;
        if items.is_empty() || items.len() * 4 > 250 {
            return Err(ParamError::DataLength(items.len() * 4, 250));
        }
        for (counter, value) in &items {
            check_counter_number(*counter)?;
            check_counter_value(*value)?;
        }

        Ok(Self {
            direction,
            sfi,
            items,
        })
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    pub fn items(&self) -> &[(u8, u32)] {
        &self.items
    }

    /// Parse `(counter, new value)` tuples from the response
    pub fn decode(&self, resp: &ApduResponse) -> Result<Vec<(u8, u32)>, ApduError> {
        Self::check_status(resp)?;

        if resp.data.len() != self.items.len() * 4 {
            return Err(ApduError::InvalidLength);
        }

        Ok(resp
            .data
            .chunks_exact(4)
            .map(|c| (c[0], BigEndian::read_u24(&c[1..4])))
            .collect())
    }
}

impl CardCommand for AdjustCounters {
    const INS: Instruction = Instruction::IncreaseMultiple;

    fn request(&self, cla: u8) -> ApduRequest {
        let ins = match self.direction {
            CounterDirection::Increase => Instruction::IncreaseMultiple,
            CounterDirection::Decrease => Instruction::DecreaseMultiple,
        };

        let mut data = Vec::with_capacity(self.items.len() * 4);
        for (counter, value) in &self.items {
            data.push(*counter);
            let mut v = [0u8; 3];
            BigEndian::write_u24(&mut v, *value);
            data.extend_from_slice(&v);
        }

        ApduRequest {
            cla,
            ins,
            p1: 0x00,
            p2: self.sfi << 3,
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
    fn increase_single() {
        let cmd = AdjustCounter::new(CounterDirection::Increase, 0x08, 2, 0x000102).unwrap();
        assert_request(&cmd, 0x00, "0032024003000102");
    }

    #[test]
    fn decrease_single() {
        let cmd = AdjustCounter::new(CounterDirection::Decrease, 0x08, 0, 0x30).unwrap();
        assert_request(&cmd, 0x00, "0030004003000030");
    }

    #[test]
    fn single_decode() {
        let cmd = AdjustCounter::new(CounterDirection::Increase, 0x08, 2, 10).unwrap();
        let resp = ApduResponse::new(hex::decode("00012c").unwrap(), 0x9000);
        assert_eq!(cmd.decode(&resp).unwrap(), 300);
    }

    #[test]
    fn increase_multiple() {
        let cmd = AdjustCounters::new(
            CounterDirection::Increase,
            0x08,
            vec![(1, 0x10), (3, 0x20)],
        )
        .unwrap();
        assert_request(&cmd, 0x00, "003a0040080100001003000020");
    }

    #[test]
    fn multiple_decode() {
        let cmd =
            AdjustCounters::new(CounterDirection::Decrease, 0x08, vec![(1, 1), (3, 2)]).unwrap();
        let resp = ApduResponse::new(hex::decode("0100000f03000020").unwrap(), 0x9000);
        assert_eq!(cmd.decode(&resp).unwrap(), vec![(1, 0x0F), (3, 0x20)]);
    }

    #[test]
    fn bad_params_rejected() {
        assert_eq!(
            AdjustCounter::new(CounterDirection::Increase, 0x08, 84, 1).unwrap_err(),
            ParamError::CounterNumber(84)
        );
        assert_eq!(
            AdjustCounter::new(CounterDirection::Increase, 0x08, 1, 0x0100_0000).unwrap_err(),
            ParamError::CounterValue(0x0100_0000)
        );
    }
}
