// Copyright (c) 2023-2024 The calypso-tx Authors

//! SEARCH RECORD APDUs
//!
//! ## Request data encoding:
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     OFFSET    |     FLAGS     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! /          SEARCH_DATA          /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! /             MASK              /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The mask always travels at full search-data length: a missing or short
//! mask is materialized / right-padded with `FF`, so equivalent searches
//! encode to identical bytes.

use crate::params::{check_record_number, check_sfi, RECORD_MAX};
use crate::records::RECORD_DATA_MAX;
use crate::{ApduError, ApduRequest, ApduResponse, CardCommand, Instruction, ParamError, StatusWord};

bitflags::bitflags! {
    /// Search behavior flags
    pub struct SearchFlags: u8 {
        /// Apply the offset to every comparison instead of only the first
        const REPEATED_OFFSET = 0x01;
        /// Return the first matching record's content with the matches
        const FETCH_FIRST = 0x02;
    }
}

const MODE_SEARCH: u8 = 0x07;

/// SEARCH RECORD request APDU
///
/// ## Encoding:
/// `CLA A2 rec P2 Lc [offset flags searchData mask] 00` with
/// `P2 = SFI<<3 | 111`
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SearchRecords {
    sfi: u8,
    from_record: u8,
    offset: u8,
    flags: SearchFlags,
    search_data: Vec<u8>,
    mask: Vec<u8>,
}

impl SearchRecords {
    pub fn new(
        sfi: u8,
        from_record: u8,
        offset: u8,
        flags: SearchFlags,
        search_data: Vec<u8>,
        mask: Option<Vec<u8>>,
    ) -> Result<Self, ParamError> {
        check_sfi(sfi)?;
        check_record_number(from_record)?;
        if offset > 249 {
            return Err(ParamError::RecordOffset(offset));
        }

        let net = RECORD_DATA_MAX - offset as usize;
        if search_data.is_empty() || search_data.len() > net {
            return Err(ParamError::SearchDataLength(search_data.len(), net));
        }

        // Materialize the mask at full length, FF-padded
        let mut mask = mask.unwrap_or_default();
        if mask.len() > search_data.len() {
            return Err(ParamError::MaskLength(mask.len(), search_data.len()));
        }
        mask.resize(search_data.len(), 0xFF);

        Ok(Self {
            sfi,
            from_record,
            offset,
            flags,
            search_data,
            mask,
        })
    }

    pub fn sfi(&self) -> u8 {
        self.sfi
    }

    pub fn fetches_first(&self) -> bool {
        self.flags.contains(SearchFlags::FETCH_FIRST)
    }

    /// Parse the match list and, when requested, the fetched first match
    pub fn decode(&self, resp: &ApduResponse) -> Result<SearchMatches, ApduError> {
        Self::check_status(resp)?;

        // A no-match soft status carries no payload
        if resp.sw == StatusWord::NO_INFORMATION && resp.data.is_empty() {
            return Ok(SearchMatches {
                records: Vec::new(),
                fetched: None,
            });
        }

        if resp.data.is_empty() {
            return Err(ApduError::InvalidLength);
        }

        let n = resp.data[0] as usize;
        if resp.data.len() < 1 + n {
            return Err(ApduError::InvalidLength);
        }

        let records = resp.data[1..1 + n].to_vec();
        for r in &records {
            if *r < 1 || *r > RECORD_MAX {
                return Err(ApduError::InvalidEncoding);
            }
        }

        let rest = &resp.data[1 + n..];
        let fetched = match (self.fetches_first(), rest.is_empty(), records.is_empty()) {
            (true, false, false) => Some(rest.to_vec()),
            (_, true, _) => None,
            _ => return Err(ApduError::InvalidEncoding),
        };

        Ok(SearchMatches { records, fetched })
    }
}

impl CardCommand for SearchRecords {
    const INS: Instruction = Instruction::SearchRecords;

    fn request(&self, cla: u8) -> ApduRequest {
        let mut data = Vec::with_capacity(2 + self.search_data.len() * 2);
        data.push(self.offset);
        data.push(self.flags.bits());
        data.extend_from_slice(&self.search_data);
        data.extend_from_slice(&self.mask);

        ApduRequest {
            cla,
            ins: Self::INS,
            p1: self.from_record,
            p2: (self.sfi << 3) | MODE_SEARCH,
            data,
            le: Some(0x00),
        }
    }

    fn accepts(sw: StatusWord) -> bool {
        sw.is_success() || sw == StatusWord::NO_INFORMATION
    }
}

/// Ordered search result
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SearchMatches {
    /// Matching record numbers, in file order
    pub records: Vec<u8>,
    /// First match's content when fetching was requested
    pub fetched: Option<Vec<u8>>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::assert_request;

    #[test]
    fn absent_and_full_ff_mask_encode_identically() {
        let without = SearchRecords::new(
            0x02,
            1,
            0,
            SearchFlags::empty(),
            vec![0x12, 0x34],
            None,
        )
        .unwrap();
        let with = SearchRecords::new(
            0x02,
            1,
            0,
            SearchFlags::empty(),
            vec![0x12, 0x34],
            Some(vec![0xFF, 0xFF]),
        )
        .unwrap();

        assert_eq!(without.request(0x00), with.request(0x00));
    }

    #[test]
    fn short_mask_is_ff_padded() {
        let cmd = SearchRecords::new(
            0x02,
            1,
            4,
            SearchFlags::REPEATED_OFFSET,
            vec![0x12, 0x34, 0x56],
            Some(vec![0xF0]),
        )
        .unwrap();

        assert_request(&cmd, 0x00, "00a20117080401123456f0ffff00");
    }

    #[test]
    fn fetch_first_flag() {
        let cmd = SearchRecords::new(
            0x02,
            3,
            0,
            SearchFlags::FETCH_FIRST,
            vec![0xAA],
            None,
        )
        .unwrap();

        assert_request(&cmd, 0x00, "00a20317040002aaff00");
    }

    #[test]
    fn decode_matches_with_fetch() {
        let cmd =
            SearchRecords::new(0x02, 1, 0, SearchFlags::FETCH_FIRST, vec![0xAA], None).unwrap();
        let resp = ApduResponse::new(hex::decode("020205aabbcc").unwrap(), 0x9000);

        let m = cmd.decode(&resp).unwrap();
        assert_eq!(m.records, vec![2, 5]);
        assert_eq!(m.fetched, Some(hex::decode("aabbcc").unwrap()));
    }

    #[test]
    fn decode_no_match_soft_status() {
        let cmd =
            SearchRecords::new(0x02, 1, 0, SearchFlags::empty(), vec![0xAA], None).unwrap();
        let resp = ApduResponse::new(vec![], 0x6200);

        let m = cmd.decode(&resp).unwrap();
        assert!(m.records.is_empty());
        assert!(m.fetched.is_none());
    }

    #[test]
    fn oversized_mask_rejected() {
        assert_eq!(
            SearchRecords::new(
                0x02,
                1,
                0,
                SearchFlags::empty(),
                vec![0xAA],
                Some(vec![0xFF, 0xFF])
            )
            .unwrap_err(),
            ParamError::MaskLength(2, 1)
        );
    }
}
