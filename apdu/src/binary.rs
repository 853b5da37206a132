// Copyright (c) 2023-2024 The calypso-tx Authors

//! Binary file read / update / write APDUs
//!
//! Offset addressing follows ISO 7816-4: with a nonzero SFI the offset
//! must fit one byte and P1 carries `0x80 | SFI`; offsets past 255 can
//! only target the currently selected file (SFI 0), with the 15-bit
//! offset split across P1/P2. The engine pins the target file with a
//! zero-offset read before issuing such commands, see the batcher.

use crate::params::{check_binary_offset, check_sfi};
use crate::{ApduError, ApduRequest, ApduResponse, CardCommand, Instruction, ParamError, StatusWord};

fn offset_header(sfi: u8, offset: usize) -> Result<(u8, u8), ParamError> {
    check_sfi(sfi)?;
    check_binary_offset(offset)?;

    if sfi != 0 {
        if offset > 0xFF {
            return Err(ParamError::BinaryOffset(offset));
        }
        Ok((0x80 | sfi, offset as u8))
    } else {
        Ok(((offset >> 8) as u8, (offset & 0xFF) as u8))
    }
}

/// READ BINARY request APDU
///
/// ## Encoding:
/// `CLA B0 P1 P2 Le` with P1/P2 the SFI / offset header
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ReadBinary {
    sfi: u8,
    offset: usize,
    length: u8,
}

impl ReadBinary {
    pub fn new(sfi: u8, offset: usize, length: u8) -> Result<Self, ParamError> {
        offset_header(sfi, offset)?;
        if length == 0 {
            return Err(ParamError::DataLength(0, 255));
        }

        Ok(Self {
            sfi,
            offset,
            length,
        })
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Parse the read content, which may run short at end of file
    pub fn decode(&self, resp: &ApduResponse) -> Result<Vec<u8>, ApduError> {
        Self::check_status(resp)?;

        if resp.data.len() > self.length as usize {
            return Err(ApduError::InvalidEncoding);
        }

        Ok(resp.data.clone())
    }
}

impl CardCommand for ReadBinary {
    const INS: Instruction = Instruction::ReadBinary;

    fn request(&self, cla: u8) -> ApduRequest {
        let (p1, p2) = offset_header(self.sfi, self.offset).expect("validated at construction");

        ApduRequest {
            cla,
            ins: Self::INS,
            p1,
            p2,
            data: Vec::new(),
            le: Some(self.length),
        }
    }

    fn accepts(sw: StatusWord) -> bool {
        sw.is_success() || sw == StatusWord::END_OF_FILE
    }
}

/// UPDATE BINARY request APDU, replacing a byte range
///
/// ## Encoding:
/// `CLA D6 P1 P2 Lc data`
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UpdateBinary {
    sfi: u8,
    offset: usize,
    data: Vec<u8>,
}

/// WRITE BINARY request APDU, OR-writing a byte range
///
/// ## Encoding:
/// `CLA D0 P1 P2 Lc data`
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WriteBinary {
    sfi: u8,
    offset: usize,
    data: Vec<u8>,
}

macro_rules! binary_write_impl {
    ($t:ty, $ins:expr) => {
        impl $t {
            pub fn new(sfi: u8, offset: usize, data: Vec<u8>) -> Result<Self, ParamError> {
                offset_header(sfi, offset)?;
                if data.is_empty() || data.len() > 255 {
                    return Err(ParamError::DataLength(data.len(), 255));
                }

                Ok(Self { sfi, offset, data })
            }

            pub fn sfi(&self) -> u8 {
                self.sfi
            }

            pub fn offset(&self) -> usize {
                self.offset
            }

            pub fn data(&self) -> &[u8] {
                &self.data
            }

            pub fn decode(&self, resp: &ApduResponse) -> Result<(), ApduError> {
                Self::check_status(resp)
            }
        }

        impl CardCommand for $t {
            const INS: Instruction = $ins;

            fn request(&self, cla: u8) -> ApduRequest {
                let (p1, p2) =
                    offset_header(self.sfi, self.offset).expect("validated at construction");

                ApduRequest {
                    cla,
                    ins: Self::INS,
                    p1,
                    p2,
                    data: self.data.clone(),
                    le: None,
                }
            }
        }
    };
}

binary_write_impl!(UpdateBinary, Instruction::UpdateBinary);
binary_write_impl!(WriteBinary, Instruction::WriteBinary);

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::assert_request;

    #[test]
    fn read_with_sfi() {
        let cmd = ReadBinary::new(0x01, 0x10, 0x20).unwrap();
        assert_request(&cmd, 0x00, "00b0811020");
    }

    #[test]
    fn read_current_file_long_offset() {
        let cmd = ReadBinary::new(0x00, 0x0123, 0x10).unwrap();
        assert_request(&cmd, 0x00, "00b0012310");
    }

    #[test]
    fn update_with_sfi() {
        let cmd = UpdateBinary::new(0x01, 0x00, vec![0x11, 0x22]).unwrap();
        assert_request(&cmd, 0x00, "00d68100021122");
    }

    #[test]
    fn write_current_file() {
        let cmd = WriteBinary::new(0x00, 0x0100, vec![0xAB]).unwrap();
        assert_request(&cmd, 0x00, "00d0010001ab");
    }

    #[test]
    fn long_offset_needs_zero_sfi() {
        assert_eq!(
            ReadBinary::new(0x01, 0x0100, 1).unwrap_err(),
            ParamError::BinaryOffset(0x0100)
        );
        assert_eq!(
            UpdateBinary::new(0x00, 0x8000, vec![0x00]).unwrap_err(),
            ParamError::BinaryOffset(0x8000)
        );
    }
}
