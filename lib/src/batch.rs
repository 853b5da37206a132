// Copyright (c) 2023-2024 The calypso-tx Authors

//! Command queue descriptors, capacity-driven splitting and response
//! application
//!
//! Prepared operations are tagged descriptors consumed in insertion
//! order. Splitting keeps every exchange's payload within the profile's
//! capacity: oversized reads become same-type commands over disjoint,
//! strictly increasing ranges; oversized writes become consecutive
//! chunks with advancing offsets.

use calypso_apdu::binary::{ReadBinary, UpdateBinary, WriteBinary};
use calypso_apdu::counters::{AdjustCounter, AdjustCounters, CounterDirection};
use calypso_apdu::invalidate::{Invalidate, Rehabilitate};
use calypso_apdu::pin::{PinData, VerifyPin};
use calypso_apdu::records::{ReadRecords, ReadRecordsPartially, UpdateRecord, WriteRecord};
use calypso_apdu::search::{SearchFlags, SearchRecords};
use calypso_apdu::select::{GetData, GetDataTag, SelectFile};
use calypso_apdu::sv::{SvDebit, SvGet, SvOperation, SvReload};
use calypso_apdu::{params, ApduRequest, ApduResponse, CardCommand, Instruction, ParamError, StatusWord};

use crate::error::Error;
use crate::image::CardImage;

/// A prepared operation, queued until the next process call
#[derive(Clone, PartialEq, Debug)]
pub enum CardOperation {
    SelectFile(SelectFile),
    GetData(GetDataTag),
    ReadRecords {
        sfi: u8,
        from_record: u8,
        count: u8,
        record_size: u8,
    },
    ReadRecordsPartially {
        sfi: u8,
        from_record: u8,
        count: u8,
        offset: u8,
        length: u8,
    },
    ReadBinary {
        sfi: u8,
        offset: usize,
        length: usize,
    },
    UpdateRecord {
        sfi: u8,
        record: u8,
        data: Vec<u8>,
    },
    WriteRecord {
        sfi: u8,
        record: u8,
        data: Vec<u8>,
    },
    UpdateBinary {
        sfi: u8,
        offset: usize,
        data: Vec<u8>,
    },
    WriteBinary {
        sfi: u8,
        offset: usize,
        data: Vec<u8>,
    },
    IncreaseCounter {
        sfi: u8,
        counter: u8,
        value: u32,
    },
    DecreaseCounter {
        sfi: u8,
        counter: u8,
        value: u32,
    },
    IncreaseCounters {
        sfi: u8,
        items: Vec<(u8, u32)>,
    },
    DecreaseCounters {
        sfi: u8,
        items: Vec<(u8, u32)>,
    },
    /// Adjust a previously read counter to an absolute target value
    SetCounter {
        sfi: u8,
        counter: u8,
        target: u32,
    },
    SearchRecords {
        sfi: u8,
        from_record: u8,
        offset: u8,
        repeated_offset: bool,
        fetch_first: bool,
        data: Vec<u8>,
        mask: Option<Vec<u8>>,
    },
    VerifyPin {
        pin: PinData,
    },
    CheckPinStatus,
    SvGet {
        operation: SvOperation,
    },
    SvReload {
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
        free: [u8; 2],
    },
    SvDebit {
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
    },
    SvUndebit {
        amount: i32,
        date: [u8; 2],
        time: [u8; 2],
    },
    Invalidate,
    Rehabilitate,
}

/// Validate a descriptor's addressing parameters, before anything is
/// queued or sent
pub(crate) fn validate_operation(op: &CardOperation) -> Result<(), ParamError> {
    match op {
        CardOperation::SelectFile(_)
        | CardOperation::GetData(_)
        | CardOperation::VerifyPin { .. }
        | CardOperation::CheckPinStatus
        | CardOperation::SvGet { .. }
        | CardOperation::Invalidate
        | CardOperation::Rehabilitate => Ok(()),

        CardOperation::ReadRecords {
            sfi,
            from_record,
            count,
            record_size,
        } => {
            params::check_sfi(*sfi)?;
            params::check_record_number(*from_record)?;
            check_record_span(*from_record, *count)?;
            if *record_size == 0 {
                return Err(ParamError::DataLength(0, 255));
            }
            Ok(())
        }

        CardOperation::ReadRecordsPartially {
            sfi,
            from_record,
            count,
            offset,
            length,
        } => {
            params::check_sfi(*sfi)?;
            params::check_record_number(*from_record)?;
            check_record_span(*from_record, *count)?;
            if *offset > params::RECORD_OFFSET_MAX {
                return Err(ParamError::RecordOffset(*offset));
            }
            if *length == 0 || *offset as usize + *length as usize > 250 {
                return Err(ParamError::DataLength(*length as usize, 250));
            }
            Ok(())
        }

        CardOperation::ReadBinary {
            sfi,
            offset,
            length,
        } => {
            params::check_sfi(*sfi)?;
            if *length == 0 {
                return Err(ParamError::DataLength(0, params::BINARY_OFFSET_MAX));
            }
            params::check_binary_offset(*offset)?;
            params::check_binary_offset(*offset + *length - 1)?;
            Ok(())
        }

        CardOperation::UpdateRecord { sfi, record, data }
        | CardOperation::WriteRecord { sfi, record, data } => {
            params::check_sfi(*sfi)?;
            params::check_record_number(*record)?;
            if data.is_empty() || data.len() > 250 {
                return Err(ParamError::DataLength(data.len(), 250));
            }
            Ok(())
        }

        CardOperation::UpdateBinary { sfi, offset, data }
        | CardOperation::WriteBinary { sfi, offset, data } => {
            params::check_sfi(*sfi)?;
            if data.is_empty() {
                return Err(ParamError::DataLength(0, params::BINARY_OFFSET_MAX));
            }
            params::check_binary_offset(*offset)?;
            params::check_binary_offset(*offset + data.len() - 1)?;
            Ok(())
        }

        CardOperation::IncreaseCounter { sfi, counter, value }
        | CardOperation::DecreaseCounter { sfi, counter, value } => {
            params::check_sfi(*sfi)?;
            params::check_counter_number(*counter)?;
            params::check_counter_value(*value)?;
            Ok(())
        }

        CardOperation::IncreaseCounters { sfi, items }
        | CardOperation::DecreaseCounters { sfi, items } => {
            params::check_sfi(*sfi)?;
            if items.is_empty() {
                return Err(ParamError::DataLength(0, 250));
            }
            for (counter, value) in items {
                params::check_counter_number(*counter)?;
                params::check_counter_value(*value)?;
            }
            Ok(())
        }

        CardOperation::SetCounter {
            sfi,
            counter,
            target,
        } => {
            params::check_sfi(*sfi)?;
            params::check_counter_number(*counter)?;
            params::check_counter_value(*target)?;
            Ok(())
        }

        CardOperation::SearchRecords {
            sfi,
            from_record,
            offset,
            repeated_offset,
            fetch_first,
            data,
            mask,
        } => {
            // The command constructor owns the full search rule set
            SearchRecords::new(
                *sfi,
                *from_record,
                *offset,
                search_flags(*repeated_offset, *fetch_first),
                data.clone(),
                mask.clone(),
            )
            .map(|_| ())
        }

        CardOperation::SvReload { amount, date, time, free } => {
            SvReload::new(*amount, *date, *time, *free).map(|_| ())
        }

        CardOperation::SvDebit { amount, date, time }
        | CardOperation::SvUndebit { amount, date, time } => {
            SvDebit::new(*amount, *date, *time).map(|_| ())
        }
    }
}

fn check_record_span(from_record: u8, count: u8) -> Result<(), ParamError> {
    if count == 0 || from_record as usize + count as usize - 1 > params::RECORD_MAX as usize {
        return Err(ParamError::RecordCount(count, from_record));
    }
    Ok(())
}

pub(crate) fn search_flags(repeated_offset: bool, fetch_first: bool) -> SearchFlags {
    let mut flags = SearchFlags::empty();
    if repeated_offset {
        flags |= SearchFlags::REPEATED_OFFSET;
    }
    if fetch_first {
        flags |= SearchFlags::FETCH_FIRST;
    }
    flags
}

/// Consecutive record runs whose combined output fits the capacity
///
/// Runs are strictly increasing in record number and cover the requested
/// span exactly; the run count is the minimum the capacity permits.
pub(crate) fn record_runs(
    from_record: u8,
    count: u8,
    record_size: u8,
    capacity: usize,
) -> Vec<(u8, u8)> {
    let per = (capacity / record_size.max(1) as usize)
        .clamp(1, 255 / record_size.max(1) as usize)
        .max(1) as u8;

    let mut runs = Vec::new();
    let mut next = from_record;
    let mut remaining = count;
    while remaining > 0 {
        let n = remaining.min(per);
        runs.push((next, n));
        next += n;
        remaining -= n;
    }
    runs
}

/// One capacity-bounded slice of a binary operation
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct BinaryChunk {
    /// SFI placed in the command; zero targets the pinned current file
    pub sfi: u8,
    pub offset: usize,
    pub len: usize,
}

/// Split a binary span into capacity-bounded chunks at strictly
/// increasing offsets
///
/// Returns whether a pinning read must precede the chunks: offsets past
/// 255 can only address the current file, so a nonzero-SFI operation
/// starting past 255 needs a zero-offset read to pin its file first.
pub(crate) fn binary_chunks(
    sfi: u8,
    offset: usize,
    total: usize,
    capacity: usize,
) -> (bool, Vec<BinaryChunk>) {
    let cap = capacity.clamp(1, 255);
    let pin = sfi != 0 && offset > 0xFF;

    let mut chunks = Vec::new();
    let mut off = offset;
    let mut remaining = total;
    let mut first = true;
    while remaining > 0 {
        let len = remaining.min(cap);
        let chunk_sfi = if sfi != 0 && first && !pin { sfi } else { 0 };
        chunks.push(BinaryChunk {
            sfi: chunk_sfi,
            offset: off,
            len,
        });
        off += len;
        remaining -= len;
        first = false;
    }

    (pin, chunks)
}

/// A concrete post-split command awaiting its exchange
#[derive(Clone, PartialEq, Debug)]
pub(crate) enum PlannedCommand {
    SelectFile(SelectFile),
    GetData(GetData),
    ReadRecords(ReadRecords),
    ReadRecordsPartially(ReadRecordsPartially),
    ReadBinary(ReadBinary),
    UpdateRecord(UpdateRecord),
    WriteRecord(WriteRecord),
    UpdateBinary(UpdateBinary),
    WriteBinary(WriteBinary),
    AdjustCounter(AdjustCounter),
    AdjustCounters(AdjustCounters),
    SearchRecords(SearchRecords),
    VerifyPin(VerifyPin),
    SvGet(SvGet),
    SvReload(SvReload),
    SvDebit(SvDebit),
    Invalidate(Invalidate),
    Rehabilitate(Rehabilitate),
}

impl PlannedCommand {
    pub fn request(&self, cla: u8) -> ApduRequest {
        match self {
            PlannedCommand::SelectFile(c) => c.request(cla),
            PlannedCommand::GetData(c) => c.request(cla),
            PlannedCommand::ReadRecords(c) => c.request(cla),
            PlannedCommand::ReadRecordsPartially(c) => c.request(cla),
            PlannedCommand::ReadBinary(c) => c.request(cla),
            PlannedCommand::UpdateRecord(c) => c.request(cla),
            PlannedCommand::WriteRecord(c) => c.request(cla),
            PlannedCommand::UpdateBinary(c) => c.request(cla),
            PlannedCommand::WriteBinary(c) => c.request(cla),
            PlannedCommand::AdjustCounter(c) => c.request(cla),
            PlannedCommand::AdjustCounters(c) => c.request(cla),
            PlannedCommand::SearchRecords(c) => c.request(cla),
            PlannedCommand::VerifyPin(c) => c.request(cla),
            PlannedCommand::SvGet(c) => c.request(cla),
            PlannedCommand::SvReload(c) => c.request(cla),
            PlannedCommand::SvDebit(c) => c.request(cla),
            PlannedCommand::Invalidate(c) => c.request(cla),
            PlannedCommand::Rehabilitate(c) => c.request(cla),
        }
    }

    pub fn instruction(&self) -> Instruction {
        match self {
            PlannedCommand::SelectFile(_) => Instruction::SelectFile,
            PlannedCommand::GetData(_) => Instruction::GetData,
            PlannedCommand::ReadRecords(_) => Instruction::ReadRecords,
            PlannedCommand::ReadRecordsPartially(_) => Instruction::ReadRecordsPartially,
            PlannedCommand::ReadBinary(_) => Instruction::ReadBinary,
            PlannedCommand::UpdateRecord(_) => Instruction::UpdateRecord,
            PlannedCommand::WriteRecord(_) => Instruction::WriteRecord,
            PlannedCommand::UpdateBinary(_) => Instruction::UpdateBinary,
            PlannedCommand::WriteBinary(_) => Instruction::WriteBinary,
            PlannedCommand::AdjustCounter(_) => Instruction::Increase,
            PlannedCommand::AdjustCounters(_) => Instruction::IncreaseMultiple,
            PlannedCommand::SearchRecords(_) => Instruction::SearchRecords,
            PlannedCommand::VerifyPin(_) => Instruction::VerifyPin,
            PlannedCommand::SvGet(_) => Instruction::SvGet,
            PlannedCommand::SvReload(_) => Instruction::SvReload,
            PlannedCommand::SvDebit(c) => {
                if c.is_undebit() {
                    Instruction::SvUndebit
                } else {
                    Instruction::SvDebit
                }
            }
            PlannedCommand::Invalidate(_) => Instruction::Invalidate,
            PlannedCommand::Rehabilitate(_) => Instruction::Rehabilitate,
        }
    }

    /// Decode the response and fold it into the card image
    pub fn apply(&self, resp: &ApduResponse, image: &mut CardImage) -> Result<(), Error> {
        let ins = self.instruction();
        match self {
            PlannedCommand::SelectFile(c) => {
                let header = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                image.ensure_file(header);
                image.set_current_sfi(header.sfi);
                if resp.sw == StatusWord::FILE_INVALIDATED {
                    image.set_invalidated(true);
                }
            }
            PlannedCommand::GetData(c) => match c.tag {
                GetDataTag::EfList => {
                    let headers =
                        GetData::decode_ef_list(resp).map_err(|e| Error::decode(ins, e))?;
                    for header in headers {
                        image.ensure_file(header);
                    }
                }
                GetDataTag::FcpForCurrentFile => {
                    let header = GetData::decode_fcp(resp).map_err(|e| Error::decode(ins, e))?;
                    image.ensure_file(header);
                    image.set_current_sfi(header.sfi);
                }
                GetDataTag::TraceabilityInformation => {
                    let blob =
                        GetData::decode_traceability(resp).map_err(|e| Error::decode(ins, e))?;
                    image.set_traceability(blob);
                }
                GetDataTag::FciForCurrentDf => {
                    GetData::check_status(resp).map_err(|e| Error::decode(ins, e))?;
                }
            },
            PlannedCommand::ReadRecords(c) => {
                let records = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                for (number, content) in records {
                    image.put_record(c.sfi(), number, content);
                }
            }
            PlannedCommand::ReadRecordsPartially(c) => {
                let slices = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                for (number, content) in slices {
                    image.merge_record_slice(c.sfi(), number, c.offset() as usize, &content);
                }
            }
            PlannedCommand::ReadBinary(c) => {
                let content = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                let sfi = image.resolve_binary_sfi(c.sfi());
                image.merge_record_slice(sfi, 1, c.offset(), &content);
            }
            PlannedCommand::UpdateRecord(c) => {
                c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                image.put_record(c.sfi(), c.record(), c.data().to_vec());
            }
            PlannedCommand::WriteRecord(c) => {
                c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                image.or_record_slice(c.sfi(), c.record(), 0, c.data());
            }
            PlannedCommand::UpdateBinary(c) => {
                c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                let sfi = image.resolve_binary_sfi(c.sfi());
                image.merge_record_slice(sfi, 1, c.offset(), c.data());
            }
            PlannedCommand::WriteBinary(c) => {
                c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                let sfi = image.resolve_binary_sfi(c.sfi());
                image.or_record_slice(sfi, 1, c.offset(), c.data());
            }
            PlannedCommand::AdjustCounter(c) => {
                let value = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                image.set_counter_value(c.sfi(), c.counter(), value);
            }
            PlannedCommand::AdjustCounters(c) => {
                let values = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                for (counter, value) in values {
                    image.set_counter_value(c.sfi(), counter, value);
                }
            }
            PlannedCommand::SearchRecords(c) => {
                let matches = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                if let (Some(content), Some(first)) =
                    (matches.fetched.as_ref(), matches.records.first())
                {
                    image.put_record(c.sfi(), *first, content.clone());
                }
                image.set_search_matches(matches.records);
            }
            PlannedCommand::VerifyPin(c) => {
                let status = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                image.set_pin_status(status);
            }
            PlannedCommand::SvGet(c) => {
                let data = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                image.init_sv(&data);
            }
            PlannedCommand::SvReload(c) => {
                let balance = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                image.apply_sv_reload(c, balance);
            }
            PlannedCommand::SvDebit(c) => {
                let balance = c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                image.apply_sv_debit(c, balance);
            }
            PlannedCommand::Invalidate(c) => {
                c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                image.set_invalidated(true);
            }
            PlannedCommand::Rehabilitate(c) => {
                c.decode(resp).map_err(|e| Error::decode(ins, e))?;
                image.set_invalidated(false);
            }
        }
        Ok(())
    }

}
