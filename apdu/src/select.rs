// Copyright (c) 2023-2024 The calypso-tx Authors

//! SELECT FILE and GET DATA APDUs, resolving file headers and data objects
//!
//! Both commands return the 8-byte file header blob wrapped in a
//! proprietary TLV:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              LID              |      SFI      |   FILE_TYPE   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  RECORD_SIZE  |  RECORD_COUNT |              RFU              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use byteorder::{BigEndian, ByteOrder};
use num_enum::TryFromPrimitive;

use crate::{ApduError, ApduRequest, ApduResponse, CardCommand, Instruction, StatusWord};

/// Proprietary TLV tag wrapping a file header blob
const TAG_FILE_HEADER: u8 = 0x85;

/// Elementary file structure types
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::Display, TryFromPrimitive)]
#[repr(u8)]
pub enum FileType {
    /// Transparent byte-addressed file
    Binary = 0x01,
    /// Fixed-size record file
    Linear = 0x02,
    /// Ring of fixed-size records
    Cyclic = 0x04,
    /// Counter file emulated over a single record
    SimulatedCounters = 0x08,
    /// Native counter file, 3-byte big-endian values
    Counters = 0x09,
}

/// Parsed 8-byte file header blob
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FileHeader {
    pub lid: u16,
    pub sfi: u8,
    pub file_type: FileType,
    pub record_size: u8,
    pub record_count: u8,
}

impl FileHeader {
    /// Parse one 8-byte header blob
    pub fn parse(blob: &[u8]) -> Result<Self, ApduError> {
        if blob.len() < 8 {
            return Err(ApduError::InvalidLength);
        }

        let file_type =
            FileType::try_from(blob[3]).map_err(|_| ApduError::InvalidEncoding)?;

        Ok(Self {
            lid: BigEndian::read_u16(&blob[0..2]),
            sfi: blob[2],
            file_type,
            record_size: blob[4],
            record_count: blob[5],
        })
    }
}

/// File navigation controls for SELECT FILE without a LID
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::Display)]
#[repr(u8)]
pub enum SelectFileControl {
    /// Re-select the current DF
    CurrentDf = 0x00,
    /// Select the first EF of the current DF
    FirstEf = 0x02,
    /// Select the EF following the currently selected one
    NextEf = 0x04,
}

/// SELECT FILE request APDU
///
/// ## Encoding:
/// `CLA A4 P1 P2 [Lc LID]` — `P1=09` with a 2-byte LID payload, or `P1=00`
/// with the navigation control in P2 and no payload.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SelectFile {
    ByLid(u16),
    Navigate(SelectFileControl),
}

impl CardCommand for SelectFile {
    const INS: Instruction = Instruction::SelectFile;

    fn request(&self, cla: u8) -> ApduRequest {
        let (p1, p2, data) = match self {
            SelectFile::ByLid(lid) => (0x09, 0x00, lid.to_be_bytes().to_vec()),
            SelectFile::Navigate(c) => (0x00, *c as u8, Vec::new()),
        };

        ApduRequest {
            cla,
            ins: Self::INS,
            p1,
            p2,
            data,
            le: None,
        }
    }

    // A selection that lands on an invalidated file still resolves its
    // header; the engine records the invalidated state.
    fn accepts(sw: StatusWord) -> bool {
        sw.is_success() || sw == StatusWord::FILE_INVALIDATED
    }
}

impl SelectFile {
    /// Parse the selection response into the selected file's header
    pub fn decode(&self, resp: &ApduResponse) -> Result<FileHeader, ApduError> {
        Self::check_status(resp)?;
        parse_header_tlv(&resp.data)
    }
}

/// GET DATA object tags
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::Display)]
#[repr(u16)]
pub enum GetDataTag {
    /// File control parameters of the currently selected file
    FcpForCurrentFile = 0x0062,
    /// File control information of the current DF
    FciForCurrentDf = 0x006F,
    /// Headers of every EF under the current DF
    EfList = 0x00C0,
    /// Opaque card traceability blob
    TraceabilityInformation = 0x0185,
}

/// GET DATA request APDU
///
/// ## Encoding:
/// `CLA CA tagHi tagLo 00`
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct GetData {
    pub tag: GetDataTag,
}

impl CardCommand for GetData {
    const INS: Instruction = Instruction::GetData;

    fn request(&self, cla: u8) -> ApduRequest {
        let tag = self.tag as u16;

        ApduRequest {
            cla,
            ins: Self::INS,
            p1: (tag >> 8) as u8,
            p2: (tag & 0xFF) as u8,
            data: Vec::new(),
            le: Some(0x00),
        }
    }
}

impl GetData {
    /// Parse an EF-list response into the headers it carries
    pub fn decode_ef_list(resp: &ApduResponse) -> Result<Vec<FileHeader>, ApduError> {
        Self::check_status(resp)?;

        let data = &resp.data;
        if data.len() < 2 || data[0] != 0xC0 || data[1] as usize != data.len() - 2 {
            return Err(ApduError::InvalidEncoding);
        }
        if (data.len() - 2) % 8 != 0 {
            return Err(ApduError::InvalidEncoding);
        }

        data[2..].chunks_exact(8).map(FileHeader::parse).collect()
    }

    /// Parse an FCP response into the current file's header
    pub fn decode_fcp(resp: &ApduResponse) -> Result<FileHeader, ApduError> {
        Self::check_status(resp)?;
        parse_header_tlv(&resp.data)
    }

    /// Parse a traceability response; the payload is kept opaque
    pub fn decode_traceability(resp: &ApduResponse) -> Result<Vec<u8>, ApduError> {
        Self::check_status(resp)?;
        Ok(resp.data.clone())
    }
}

fn parse_header_tlv(data: &[u8]) -> Result<FileHeader, ApduError> {
    if data.len() < 2 {
        return Err(ApduError::InvalidLength);
    }
    if data[0] != TAG_FILE_HEADER || data[1] as usize != data.len() - 2 {
        return Err(ApduError::InvalidEncoding);
    }

    FileHeader::parse(&data[2..])
}
