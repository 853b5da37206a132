// Copyright (c) 2023-2024 The calypso-tx Authors

//! Record read / update / write APDUs
//!
//! P2 packs the SFI into its upper five bits; the lower three select the
//! addressing mode (`100` one record, `101` from-record-onwards).

use crate::params::{check_record_number, check_sfi, RECORD_MAX};
use crate::{ApduError, ApduRequest, ApduResponse, CardCommand, Instruction, ParamError, StatusWord};

/// Largest record payload
pub const RECORD_DATA_MAX: usize = 250;

const MODE_ONE_RECORD: u8 = 0x04;
const MODE_FROM_RECORD: u8 = 0x05;

/// READ RECORDS request APDU
///
/// ## Encoding:
/// `CLA B2 rec P2 Le` with `P2 = SFI<<3 | mode`, `Le = count * record_size`
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ReadRecords {
    sfi: u8,
    from_record: u8,
    count: u8,
    record_size: u8,
}

impl ReadRecords {
    pub fn new(sfi: u8, from_record: u8, count: u8, record_size: u8) -> Result<Self, ParamError> {
        check_sfi(sfi)?;
        check_record_number(from_record)?;
        if count == 0 || from_record as usize + count as usize - 1 > RECORD_MAX as usize {
            return Err(ParamError::RecordCount(count, from_record));
        }

        let le = count as usize * record_size as usize;
        if le == 0 || le > 255 {
            return Err(ParamError::DataLength(le, 255));
        }

        Ok(Self {
            sfi,
            from_record,
            count,
            record_size,
        })
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    /// Parse the response into `(record number, content)` pairs
    ///
    /// An end-of-file soft status may legitimately yield fewer records
    /// than requested.
    pub fn decode(&self, resp: &ApduResponse) -> Result<Vec<(u8, Vec<u8>)>, ApduError> {
        Self::check_status(resp)?;

        if self.count == 1 {
            if resp.data.is_empty() {
                return Err(ApduError::InvalidLength);
            }
            return Ok(vec![(self.from_record, resp.data.clone())]);
        }

        if resp.data.len() % self.record_size as usize != 0 {
            return Err(ApduError::InvalidEncoding);
        }

        Ok(resp
            .data
            .chunks_exact(self.record_size as usize)
            .enumerate()
            .map(|(i, c)| (self.from_record + i as u8, c.to_vec()))
            .collect())
    }
}

impl CardCommand for ReadRecords {
    const INS: Instruction = Instruction::ReadRecords;

    fn request(&self, cla: u8) -> ApduRequest {
        let mode = if self.count == 1 {
            MODE_ONE_RECORD
        } else {
            MODE_FROM_RECORD
        };

        ApduRequest {
            cla,
            ins: Self::INS,
            p1: self.from_record,
            p2: (self.sfi << 3) | mode,
            data: Vec::new(),
            le: Some((self.count as usize * self.record_size as usize) as u8),
        }
    }

    fn accepts(sw: StatusWord) -> bool {
        sw.is_success() || sw == StatusWord::END_OF_FILE
    }
}

/// READ RECORDS PARTIALLY request APDU, fetching the same byte range out
/// of several consecutive records
///
/// ## Encoding:
/// `CLA B3 rec P2 04 54 02 offset length Le` with `P2 = SFI<<3 | 101`
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ReadRecordsPartially {
    sfi: u8,
    from_record: u8,
    count: u8,
    offset: u8,
    length: u8,
}

impl ReadRecordsPartially {
    pub fn new(
        sfi: u8,
        from_record: u8,
        count: u8,
        offset: u8,
        length: u8,
    ) -> Result<Self, ParamError> {
        check_sfi(sfi)?;
        check_record_number(from_record)?;
        if count == 0 || from_record as usize + count as usize - 1 > RECORD_MAX as usize {
            return Err(ParamError::RecordCount(count, from_record));
        }
        if offset > 249 {
            return Err(ParamError::RecordOffset(offset));
        }
        if length == 0 || offset as usize + length as usize > RECORD_DATA_MAX {
            return Err(ParamError::DataLength(length as usize, RECORD_DATA_MAX));
        }
        if count as usize * length as usize > 255 {
            return Err(ParamError::DataLength(count as usize * length as usize, 255));
        }

        Ok(Self {
            sfi,
            from_record,
            count,
            offset,
            length,
        })
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    /// Parse the response into `(record number, partial content)` pairs
    pub fn decode(&self, resp: &ApduResponse) -> Result<Vec<(u8, Vec<u8>)>, ApduError> {
        Self::check_status(resp)?;

        if resp.data.len() % self.length as usize != 0 {
            return Err(ApduError::InvalidEncoding);
        }

        Ok(resp
            .data
            .chunks_exact(self.length as usize)
            .enumerate()
            .map(|(i, c)| (self.from_record + i as u8, c.to_vec()))
            .collect())
    }
}

impl CardCommand for ReadRecordsPartially {
    const INS: Instruction = Instruction::ReadRecordsPartially;

    fn request(&self, cla: u8) -> ApduRequest {
        ApduRequest {
            cla,
            ins: Self::INS,
            p1: self.from_record,
            p2: (self.sfi << 3) | MODE_FROM_RECORD,
            data: vec![0x54, 0x02, self.offset, self.length],
            le: Some((self.count as usize * self.length as usize) as u8),
        }
    }

    fn accepts(sw: StatusWord) -> bool {
        sw.is_success() || sw == StatusWord::END_OF_FILE
    }
}

/// UPDATE RECORD request APDU, replacing a record's content
///
/// ## Encoding:
/// `CLA DC rec P2 Lc data` with `P2 = SFI<<3 | 100`
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UpdateRecord {
    sfi: u8,
    record: u8,
    data: Vec<u8>,
}

impl UpdateRecord {
    pub fn new(sfi: u8, record: u8, data: Vec<u8>) -> Result<Self, ParamError> {
        check_sfi(sfi)?;
        check_record_number(record)?;
        if data.is_empty() || data.len() > RECORD_DATA_MAX {
            return Err(ParamError::DataLength(data.len(), RECORD_DATA_MAX));
        }

        Ok(Self { sfi, record, data })
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    pub fn record(&self) -> u8 {
        self.record
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn decode(&self, resp: &ApduResponse) -> Result<(), ApduError> {
        Self::check_status(resp)
    }
}

impl CardCommand for UpdateRecord {
    const INS: Instruction = Instruction::UpdateRecord;

    fn request(&self, cla: u8) -> ApduRequest {
        ApduRequest {
            cla,
            ins: Self::INS,
            p1: self.record,
            p2: (self.sfi << 3) | MODE_ONE_RECORD,
            data: self.data.clone(),
            le: None,
        }
    }
}

/// WRITE RECORD request APDU, OR-writing into a record's content
///
/// ## Encoding:
/// `CLA D2 rec P2 Lc data` with `P2 = SFI<<3 | 100`
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WriteRecord {
    sfi: u8,
    record: u8,
    data: Vec<u8>,
}

impl WriteRecord {
    pub fn new(sfi: u8, record: u8, data: Vec<u8>) -> Result<Self, ParamError> {
        check_sfi(sfi)?;
        check_record_number(record)?;
        if data.is_empty() || data.len() > RECORD_DATA_MAX {
            return Err(ParamError::DataLength(data.len(), RECORD_DATA_MAX));
        }

        Ok(Self { sfi, record, data })
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    pub fn record(&self) -> u8 {
        self.record
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn decode(&self, resp: &ApduResponse) -> Result<(), ApduError> {
        Self::check_status(resp)
    }
}

impl CardCommand for WriteRecord {
    const INS: Instruction = Instruction::WriteRecord;

    fn request(&self, cla: u8) -> ApduRequest {
        ApduRequest {
            cla,
            ins: Self::INS,
            p1: self.record,
            p2: (self.sfi << 3) | MODE_ONE_RECORD,
            data: self.data.clone(),
            le: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::assert_request;

    #[test]
    fn read_one_record() {
        let cmd = ReadRecords::new(0x04, 1, 1, 0x1D).unwrap();
        assert_request(&cmd, 0x00, "00b201241d");
    }

    #[test]
    fn read_several_records() {
        let cmd = ReadRecords::new(0x04, 2, 3, 0x10).unwrap();
        assert_request(&cmd, 0x00, "00b2022530");
    }

    #[test]
    fn read_decode_multiple() {
        let cmd = ReadRecords::new(0x04, 2, 2, 4).unwrap();
        let resp = ApduResponse::new(hex::decode("aabbccdd11223344").unwrap(), 0x9000);

        let records = cmd.decode(&resp).unwrap();
        assert_eq!(
            records,
            vec![
                (2, hex::decode("aabbccdd").unwrap()),
                (3, hex::decode("11223344").unwrap()),
            ]
        );
    }

    #[test]
    fn read_decode_truncated_by_eof() {
        let cmd = ReadRecords::new(0x04, 2, 3, 4).unwrap();
        let resp = ApduResponse::new(hex::decode("aabbccdd").unwrap(), 0x6282);

        let records = cmd.decode(&resp).unwrap();
        assert_eq!(records, vec![(2, hex::decode("aabbccdd").unwrap())]);
    }

    #[test]
    fn read_partial() {
        let cmd = ReadRecordsPartially::new(0x02, 1, 4, 10, 2).unwrap();
        assert_request(&cmd, 0x00, "00b301150454020a0208");
    }

    #[test]
    fn update_record() {
        let cmd = UpdateRecord::new(0x07, 2, hex::decode("a1a2a3").unwrap()).unwrap();
        assert_request(&cmd, 0x00, "00dc023c03a1a2a3");
    }

    #[test]
    fn write_record() {
        let cmd = WriteRecord::new(0x07, 2, hex::decode("a1a2a3").unwrap()).unwrap();
        assert_request(&cmd, 0x00, "00d2023c03a1a2a3");
    }

    #[test]
    fn bad_params_rejected() {
        assert_eq!(
            ReadRecords::new(0x1F, 1, 1, 10).unwrap_err(),
            ParamError::Sfi(0x1F)
        );
        assert_eq!(
            ReadRecords::new(0x04, 0, 1, 10).unwrap_err(),
            ParamError::RecordNumber(0)
        );
        assert_eq!(
            ReadRecords::new(0x04, 250, 2, 10).unwrap_err(),
            ParamError::RecordCount(2, 250)
        );
        assert_eq!(
            UpdateRecord::new(0x04, 1, vec![]).unwrap_err(),
            ParamError::DataLength(0, RECORD_DATA_MAX)
        );
    }
}
