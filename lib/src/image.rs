// Copyright (c) 2023-2024 The calypso-tx Authors

//! In-memory image of the card's addressable storage
//!
//! One image per logical card session. Files are indexed both by SFI and
//! by LID; the two indices move together. Content is only ever mutated by
//! response application, so the image converges on what the card actually
//! answered.

use std::collections::BTreeMap;

use calypso_apdu::pin::PinStatus;
use calypso_apdu::select::{FileHeader, FileType};
use calypso_apdu::session::WriteAccessLevel;
use calypso_apdu::sv::{SvDebit, SvDebitLogRecord, SvGetData, SvLoadLogRecord, SvReload};

use crate::profile::CardProfile;

/// One elementary file: resolved header plus the records read so far
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ElementaryFile {
    header: FileHeader,
    records: BTreeMap<u8, Vec<u8>>,
}

impl ElementaryFile {
    fn new(header: FileHeader) -> Self {
        Self {
            header,
            records: BTreeMap::new(),
        }
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Raw content of one record, if it has been read
    pub fn record(&self, number: u8) -> Option<&[u8]> {
        self.records.get(&number).map(Vec::as_slice)
    }

    /// All records read so far, in record order
    pub fn records(&self) -> &BTreeMap<u8, Vec<u8>> {
        &self.records
    }

    /// Derived counter view: 3-byte big-endian values in record 1
    ///
    /// Only counter-typed files expose counters.
    pub fn counter(&self, number: u8) -> Option<u32> {
        if !matches!(
            self.header.file_type,
            FileType::Counters | FileType::SimulatedCounters
        ) {
            return None;
        }

        let content = self.record(1)?;
        let at = number as usize * 3;
        let bytes = content.get(at..at + 3)?;

        Some(u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2]))
    }

    /// All counters resolvable from the content read so far
    pub fn counters(&self) -> BTreeMap<u8, u32> {
        let mut out = BTreeMap::new();
        let mut n = 0u8;
        while let Some(v) = self.counter(n) {
            out.insert(n, v);
            n += 1;
        }
        out
    }

    fn set_record(&mut self, number: u8, data: Vec<u8>) {
        self.records.insert(number, data);
    }

    /// Merge a partial slice into a record, zero-padding any gap
    fn merge_slice(&mut self, number: u8, offset: usize, data: &[u8]) {
        let record = self.records.entry(number).or_default();
        if record.len() < offset + data.len() {
            record.resize(offset + data.len(), 0);
        }
        record[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// Stored value balance, transaction number and last log records
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StoredValueState {
    /// Current balance, signed 24-bit semantics
    pub balance: i32,
    /// Last SV transaction number
    pub tnum: u16,
    /// Current SV key version
    pub kvc: u8,
    /// Last load operation
    pub load_log: Option<SvLoadLogRecord>,
    /// Last debit operation
    pub debit_log: Option<SvDebitLogRecord>,
}

/// State of the secure session currently open on the card
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SessionContext {
    pub level: WriteAccessLevel,
    pub transaction_counter: u32,
    pub previous_session_ratified: bool,
    /// Identifier of the session key the card selected
    pub kif: u8,
    /// Version of the session key the card selected
    pub kvc: u8,
    pub(crate) exchanged: Vec<Vec<u8>>,
}

impl SessionContext {
    /// Raw request / response bytes exchanged inside the session so far,
    /// in wire order
    pub fn exchanged(&self) -> &[Vec<u8>] {
        &self.exchanged
    }
}

/// In-memory card image
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CardImage {
    profile: CardProfile,
    files: BTreeMap<u8, ElementaryFile>,
    lid_index: BTreeMap<u16, u8>,
    current_sfi: Option<u8>,
    traceability: Option<Vec<u8>>,
    sv: Option<StoredValueState>,
    pin_status: Option<PinStatus>,
    invalidated: bool,
    session: Option<SessionContext>,
    last_search: Option<Vec<u8>>,
}

impl CardImage {
    pub fn new(profile: CardProfile) -> Self {
        Self {
            profile,
            files: BTreeMap::new(),
            lid_index: BTreeMap::new(),
            current_sfi: None,
            traceability: None,
            sv: None,
            pin_status: None,
            invalidated: false,
            session: None,
            last_search: None,
        }
    }

    pub fn profile(&self) -> &CardProfile {
        &self.profile
    }

    pub fn file_by_sfi(&self, sfi: u8) -> Option<&ElementaryFile> {
        self.files.get(&sfi)
    }

    pub fn file_by_lid(&self, lid: u16) -> Option<&ElementaryFile> {
        self.lid_index.get(&lid).and_then(|sfi| self.files.get(sfi))
    }

    /// Derived counter value, present once its file content was read
    pub fn counter(&self, sfi: u8, number: u8) -> Option<u32> {
        self.file_by_sfi(sfi).and_then(|f| f.counter(number))
    }

    /// Opaque traceability blob, populated by GET DATA
    pub fn traceability(&self) -> Option<&[u8]> {
        self.traceability.as_deref()
    }

    pub fn sv(&self) -> Option<&StoredValueState> {
        self.sv.as_ref()
    }

    pub fn pin_status(&self) -> Option<PinStatus> {
        self.pin_status
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.session.as_ref()
    }

    /// Record numbers matched by the latest search
    pub fn search_matches(&self) -> Option<&[u8]> {
        self.last_search.as_deref()
    }

    /// Insert or refresh a file header, keeping both indices aligned
    pub(crate) fn ensure_file(&mut self, header: FileHeader) {
        if let Some(existing) = self.files.get(&header.sfi) {
            let old_lid = existing.header.lid;
            if old_lid != 0 && old_lid != header.lid {
                self.lid_index.remove(&old_lid);
            }
        }

        self.files
            .entry(header.sfi)
            .and_modify(|f| f.header = header)
            .or_insert_with(|| ElementaryFile::new(header));

        if header.lid != 0 {
            self.lid_index.insert(header.lid, header.sfi);
        }
    }

    /// File entry for content updates, created with a placeholder header
    /// when the content arrives before any header resolution
    fn file_entry(&mut self, sfi: u8) -> &mut ElementaryFile {
        self.files.entry(sfi).or_insert_with(|| {
            ElementaryFile::new(FileHeader {
                lid: 0,
                sfi,
                file_type: FileType::Linear,
                record_size: 0,
                record_count: 0,
            })
        })
    }

    pub(crate) fn put_record(&mut self, sfi: u8, number: u8, data: Vec<u8>) {
        self.file_entry(sfi).set_record(number, data);
    }

    pub(crate) fn merge_record_slice(&mut self, sfi: u8, number: u8, offset: usize, data: &[u8]) {
        self.file_entry(sfi).merge_slice(number, offset, data);
    }

    /// OR-write a slice into a record, matching the card's WRITE semantics
    pub(crate) fn or_record_slice(&mut self, sfi: u8, number: u8, offset: usize, data: &[u8]) {
        let file = self.file_entry(sfi);
        let record = file.records.entry(number).or_default();
        if record.len() < offset + data.len() {
            record.resize(offset + data.len(), 0);
        }
        for (i, b) in data.iter().enumerate() {
            record[offset + i] |= b;
        }
    }

    pub(crate) fn set_counter_value(&mut self, sfi: u8, counter: u8, value: u32) {
        let bytes = [(value >> 16) as u8, (value >> 8) as u8, value as u8];
        self.merge_record_slice(sfi, 1, counter as usize * 3, &bytes);
    }

    /// SFI a binary command actually addressed: a nonzero SFI selects and
    /// pins that file, SFI zero targets whatever is currently pinned
    pub(crate) fn resolve_binary_sfi(&mut self, command_sfi: u8) -> u8 {
        if command_sfi != 0 {
            self.current_sfi = Some(command_sfi);
            command_sfi
        } else {
            self.current_sfi.unwrap_or(0)
        }
    }

    pub(crate) fn set_current_sfi(&mut self, sfi: u8) {
        self.current_sfi = Some(sfi);
    }

    pub(crate) fn current_sfi(&self) -> Option<u8> {
        self.current_sfi
    }

    pub(crate) fn set_traceability(&mut self, data: Vec<u8>) {
        self.traceability = Some(data);
    }

    pub(crate) fn init_sv(&mut self, data: &SvGetData) {
        self.sv = Some(StoredValueState {
            balance: data.balance,
            tnum: data.tnum,
            kvc: data.kvc,
            load_log: data.load_log,
            debit_log: data.debit_log,
        });
    }

    /// Fold a completed reload into the stored value state
    ///
    /// The synthesized log anticipates the card's own record; the next SV
    /// Get overwrites it with card truth.
    pub(crate) fn apply_sv_reload(&mut self, cmd: &SvReload, new_balance: i32) {
        if let Some(sv) = self.sv.as_mut() {
            sv.tnum = sv.tnum.wrapping_add(1);
            let prev = sv.load_log;
            sv.load_log = Some(SvLoadLogRecord {
                date: cmd.date(),
                free1: cmd.free()[0],
                kvc: sv.kvc,
                free2: cmd.free()[1],
                balance: new_balance,
                amount: cmd.amount(),
                time: cmd.time(),
                sam_id: prev.map(|l| l.sam_id).unwrap_or_default(),
                sam_tnum: prev.map(|l| l.sam_tnum.wrapping_add(1)).unwrap_or(0),
                sv_tnum: sv.tnum,
            });
            sv.balance = new_balance;
        }
    }

    /// Fold a completed debit or undebit into the stored value state
    pub(crate) fn apply_sv_debit(&mut self, cmd: &SvDebit, new_balance: i32) {
        if let Some(sv) = self.sv.as_mut() {
            sv.tnum = sv.tnum.wrapping_add(1);
            let prev = sv.debit_log;
            let amount = if cmd.is_undebit() {
                -(cmd.amount() as i16)
            } else {
                cmd.amount() as i16
            };
            sv.debit_log = Some(SvDebitLogRecord {
                amount,
                date: cmd.date(),
                time: cmd.time(),
                free: 0,
                kvc: sv.kvc,
                sam_id: prev.map(|l| l.sam_id).unwrap_or_default(),
                sam_tnum: prev.map(|l| l.sam_tnum.wrapping_add(1)).unwrap_or(0),
                balance: new_balance,
                sv_tnum: sv.tnum,
            });
            sv.balance = new_balance;
        }
    }

    pub(crate) fn set_pin_status(&mut self, status: PinStatus) {
        self.pin_status = Some(status);
    }

    pub(crate) fn set_invalidated(&mut self, invalidated: bool) {
        self.invalidated = invalidated;
    }

    pub(crate) fn set_search_matches(&mut self, records: Vec<u8>) {
        self.last_search = Some(records);
    }

    pub(crate) fn open_session(&mut self, ctx: SessionContext) {
        self.session = Some(ctx);
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut SessionContext> {
        self.session.as_mut()
    }

    pub(crate) fn close_session(&mut self) -> Option<SessionContext> {
        self.session.take()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::profile::ProductType;

    fn image() -> CardImage {
        CardImage::new(CardProfile::for_product(ProductType::PrimeRevision3))
    }

    fn counters_header(sfi: u8, lid: u16) -> FileHeader {
        FileHeader {
            lid,
            sfi,
            file_type: FileType::Counters,
            record_size: 9,
            record_count: 1,
        }
    }

    #[test]
    fn indices_stay_consistent() {
        let mut img = image();
        img.ensure_file(counters_header(0x08, 0x2000));

        assert!(img.file_by_sfi(0x08).is_some());
        assert_eq!(
            img.file_by_lid(0x2000).unwrap().header().sfi,
            img.file_by_sfi(0x08).unwrap().header().sfi,
        );

        // Re-resolving the header under a new LID moves the LID index
        img.ensure_file(counters_header(0x08, 0x2001));
        assert!(img.file_by_lid(0x2000).is_none());
        assert_eq!(img.file_by_lid(0x2001).unwrap().header().sfi, 0x08);
    }

    #[test]
    fn counters_view() {
        let mut img = image();
        img.ensure_file(counters_header(0x08, 0x2000));
        img.put_record(0x08, 1, vec![0x00, 0x00, 0x0A, 0x00, 0x01, 0x00, 0xFF, 0xFF, 0xFF]);

        let file = img.file_by_sfi(0x08).unwrap();
        assert_eq!(file.counter(0), Some(10));
        assert_eq!(file.counter(1), Some(256));
        assert_eq!(file.counter(2), Some(0x00FF_FFFF));
        assert_eq!(file.counter(3), None);
        assert_eq!(file.counters().len(), 3);
    }

    #[test]
    fn non_counter_files_expose_no_counters() {
        let mut img = image();
        img.put_record(0x04, 1, vec![0x00; 9]);
        assert_eq!(img.counter(0x04, 0), None);
    }

    #[test]
    fn set_counter_value_updates_content() {
        let mut img = image();
        img.ensure_file(counters_header(0x08, 0x2000));
        img.put_record(0x08, 1, vec![0x00; 9]);
        img.set_counter_value(0x08, 1, 0x0000_0102);

        assert_eq!(img.counter(0x08, 1), Some(0x0102));
        assert_eq!(img.counter(0x08, 0), Some(0));
    }

    #[test]
    fn merge_slice_pads_gaps() {
        let mut img = image();
        img.merge_record_slice(0x01, 1, 4, &[0xAA, 0xBB]);

        let content = img.file_by_sfi(0x01).unwrap().record(1).unwrap();
        assert_eq!(content, &[0x00, 0x00, 0x00, 0x00, 0xAA, 0xBB]);
    }

    #[test]
    fn binary_sfi_resolution_pins_the_file() {
        let mut img = image();
        assert_eq!(img.resolve_binary_sfi(0x05), 0x05);
        assert_eq!(img.resolve_binary_sfi(0x00), 0x05);
    }
}
