// Copyright (c) 2023-2024 The calypso-tx Authors

//! Card transaction manager: the ordered command queue, the batcher's
//! exchange loop and the secure session coordinator
//!
//! One manager instance serializes all exchanges against one card and,
//! when configured, one crypto module. Callers prepare operations, then
//! trigger a processing unit with one of the `process_*` methods; within
//! a unit, card and crypto-module exchanges happen in the fixed
//! interleaving the session protocol requires, and the crypto module is
//! synchronized exactly once after the last unit that touched it, once no
//! session spans further units.
//!
//! Instances are not thread safe; keep each one on a single thread.

use std::mem;

use log::{debug, trace, warn};

use calypso_apdu::binary::{ReadBinary, UpdateBinary, WriteBinary};
use calypso_apdu::counters::{AdjustCounter, AdjustCounters, CounterDirection};
use calypso_apdu::invalidate::{Invalidate, Rehabilitate};
use calypso_apdu::key::{ChangeKey, KeyRef};
use calypso_apdu::pin::{
    ChangePin, GetChallenge, PinData, VerifyPin, CIPHERED_PIN_CHANGE_LEN, CIPHERED_PIN_LEN,
};
use calypso_apdu::records::{ReadRecords, ReadRecordsPartially, UpdateRecord, WriteRecord};
use calypso_apdu::search::SearchRecords;
use calypso_apdu::select::GetData;
use calypso_apdu::session::{
    AbortSession, CloseSession, OpenSession, OpenSessionResponse, WriteAccessLevel, CHALLENGE_LEN,
    SIGNATURE_LEN,
};
use calypso_apdu::sv::{SvDebit, SvGet, SvGetVariant, SvOperation, SvReload};
use calypso_apdu::{ApduRequest, ApduResponse, CardCommand, Instruction};

use crate::batch::{
    binary_chunks, record_runs, search_flags, validate_operation, CardOperation, PlannedCommand,
};
use crate::crypto::{CryptoModule, NoCrypto, KEY_CRYPTOGRAM_LEN};
use crate::error::{Error, StateError};
use crate::image::{CardImage, SessionContext};
use crate::profile::{CardFeatures, CardProfile};
use crate::settings::SecuritySettings;
use crate::transport::CardTransport;

/// Secure session life cycle
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::Display)]
pub enum SessionStatus {
    Closed,
    Opening,
    Open,
    Closing,
    Aborting,
}

/// Anticipated opening data registered for the pre-open optimization
#[derive(Clone, Debug)]
struct PreOpenSession {
    level: WriteAccessLevel,
    data_out: Vec<u8>,
    kif: u8,
    kvc: u8,
}

/// Commands accumulated towards the next exchange group
#[derive(Default)]
struct Pending {
    group: Vec<PlannedCommand>,
    body: usize,
    /// Index of the first queued operation with commands still unsent
    first_op: Option<usize>,
    /// Highest operation index in the group being assembled
    group_last_op: Option<usize>,
    /// Highest operation index whose commands reached the wire
    attempted_op: Option<usize>,
}

/// Calypso card transaction manager
pub struct CardTransactionManager<T: CardTransport, C: CryptoModule = NoCrypto> {
    transport: T,
    crypto: Option<C>,
    settings: SecuritySettings,
    image: CardImage,
    queue: Vec<CardOperation>,
    status: SessionStatus,
    pre_open: Option<PreOpenSession>,
    mac_pending: Vec<Vec<u8>>,
    sync_pending: bool,
    unit_sv: Option<(SvGetVariant, Vec<u8>, Vec<u8>)>,
}

impl<T: CardTransport> CardTransactionManager<T, NoCrypto> {
    /// Manager for plaintext transactions, no crypto module attached
    pub fn new(transport: T, profile: CardProfile) -> Self {
        Self::build(transport, None, SecuritySettings::default(), profile)
    }
}

impl<T: CardTransport, C: CryptoModule> CardTransactionManager<T, C> {
    /// Manager bound to a crypto module for secure sessions and the
    /// ciphered sub-protocols
    pub fn with_crypto(
        transport: T,
        profile: CardProfile,
        crypto: C,
        settings: SecuritySettings,
    ) -> Self {
        Self::build(transport, Some(crypto), settings, profile)
    }

    fn build(
        transport: T,
        crypto: Option<C>,
        settings: SecuritySettings,
        profile: CardProfile,
    ) -> Self {
        Self {
            transport,
            crypto,
            settings,
            image: CardImage::new(profile),
            queue: Vec::new(),
            status: SessionStatus::Closed,
            pre_open: None,
            mac_pending: Vec::new(),
            sync_pending: false,
            unit_sv: None,
        }
    }

    /// Card image assembled from the responses applied so far
    pub fn card(&self) -> &CardImage {
        &self.image
    }

    pub fn session_status(&self) -> SessionStatus {
        self.status
    }

    pub fn security_settings(&self) -> &SecuritySettings {
        &self.settings
    }

    pub fn security_settings_mut(&mut self) -> &mut SecuritySettings {
        &mut self.settings
    }

    /// Number of operations still queued
    pub fn prepared_count(&self) -> usize {
        self.queue.len()
    }

    /// Drop every queued operation without sending anything
    pub fn discard_prepared(&mut self) {
        self.queue.clear();
    }

    /// Queue an operation for the next processing unit
    ///
    /// Parameters are validated here; nothing is sent. Protocol-state
    /// prerequisites (counter read before set, SV ordering, validity
    /// state, feature support) are checked against the current image.
    pub fn prepare(&mut self, op: CardOperation) -> Result<(), Error> {
        validate_operation(&op)?;

        match &op {
            CardOperation::SetCounter { sfi, counter, .. } => {
                if self.image.counter(*sfi, *counter).is_none() {
                    return Err(StateError::CounterNotRead {
                        sfi: *sfi,
                        counter: *counter,
                    }
                    .into());
                }
            }
            CardOperation::SearchRecords { .. } => {
                self.require_feature(CardFeatures::RECORD_SEARCH, "record search")?;
            }
            CardOperation::VerifyPin { .. } => {
                self.require_feature(CardFeatures::PIN, "PIN verification")?;
                if !self.settings.plain_pin_transmission && self.crypto.is_none() {
                    return Err(StateError::NoCryptoModule.into());
                }
            }
            CardOperation::CheckPinStatus => {
                self.require_feature(CardFeatures::PIN, "PIN verification")?;
            }
            CardOperation::SvGet { .. } => {
                self.require_feature(CardFeatures::STORED_VALUE, "stored value")?;
            }
            CardOperation::SvReload { .. } => self.check_sv_ordering(SvOperation::Reload)?,
            CardOperation::SvDebit { .. } => self.check_sv_ordering(SvOperation::Debit)?,
            CardOperation::SvUndebit { .. } => self.check_sv_ordering(SvOperation::Undebit)?,
            CardOperation::Invalidate => {
                if self.image.is_invalidated() {
                    return Err(StateError::AlreadyInvalidated.into());
                }
            }
            CardOperation::Rehabilitate => {
                if !self.image.is_invalidated() {
                    return Err(StateError::NotInvalidated.into());
                }
            }
            _ => {}
        }

        self.queue.push(op);
        Ok(())
    }

    /// Register anticipated open-session data for the next opening at
    /// the same write-access level
    ///
    /// The blob must parse as open-session data-out; the engine falls
    /// back to a cold open when the crypto module lacks extended mode or
    /// the levels differ.
    pub fn prepare_pre_open(
        &mut self,
        level: WriteAccessLevel,
        data_out: Vec<u8>,
    ) -> Result<(), Error> {
        let parsed = OpenSessionResponse::parse(&data_out)
            .map_err(|e| Error::decode(Instruction::OpenSession, e))?;

        self.pre_open = Some(PreOpenSession {
            level,
            kif: parsed.kif,
            kvc: parsed.kvc,
            data_out,
        });
        Ok(())
    }

    /// Execute the prepared operations, plaintext or inside the open
    /// session
    pub fn process_commands(&mut self) -> Result<(), Error> {
        self.run_unit(|m| m.drain_queue())
    }

    /// Open a secure session, then execute the prepared operations
    /// inside it
    pub fn process_opening(&mut self, level: WriteAccessLevel) -> Result<(), Error> {
        self.run_unit(|m| m.open_session(level))
    }

    /// Execute the remaining prepared operations, then close and
    /// authenticate the session
    pub fn process_closing(&mut self) -> Result<(), Error> {
        self.run_unit(|m| m.close_session())
    }

    /// Abort the session, best-effort
    ///
    /// The abort APDU is sent even with no local session state so a card
    /// left desynchronized by an earlier failure is reset.
    pub fn process_cancel(&mut self) -> Result<(), Error> {
        self.run_unit(|m| m.abort_session())
    }

    /// Replace the PIN, its own processing unit; rejected inside a
    /// session
    pub fn process_change_pin(
        &mut self,
        current_pin: Option<&PinData>,
        new_pin: &PinData,
    ) -> Result<(), Error> {
        self.run_unit(|m| {
            if m.status != SessionStatus::Closed {
                return Err(StateError::NotAllowedInSession.into());
            }
            m.require_feature(CardFeatures::PIN, "PIN modification")?;

            let cmd = if m.settings.plain_pin_transmission {
                ChangePin::Plain(new_pin.clone())
            } else {
                let challenge = m.get_card_challenge()?;
                let key = m.settings.pin_modification_key;
                let block = m.crypto_cipher_pin_modification(&challenge, current_pin, new_pin, key)?;
                ChangePin::Ciphered(block)
            };

            let req = cmd.request(m.cla());
            let resp = m.transmit_one(req)?;
            cmd.decode(&resp)
                .map_err(|e| Error::decode(Instruction::ChangePin, e))
        })
    }

    /// Replace a card key with a block ciphered by the crypto module,
    /// its own processing unit; rejected inside a session
    pub fn process_change_key(
        &mut self,
        key_index: u8,
        new_key: KeyRef,
        issuer_key: KeyRef,
    ) -> Result<(), Error> {
        self.run_unit(|m| {
            if m.status != SessionStatus::Closed {
                return Err(StateError::NotAllowedInSession.into());
            }

            let challenge = m.get_card_challenge()?;
            let cryptogram = m.crypto_generate_key(&challenge, issuer_key, new_key)?;
            let cmd = ChangeKey::new(key_index, cryptogram.to_vec())?;

            let req = cmd.request(m.cla());
            let resp = m.transmit_one(req)?;
            cmd.decode(&resp)
                .map_err(|e| Error::decode(Instruction::ChangeKey, e))
        })
    }

    // --- processing unit plumbing ---

    /// Run one processing unit; the crypto module is synchronized
    /// exactly once after the unit, deferred while a session still spans
    /// units, business outcome notwithstanding.
    fn run_unit<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Self) -> Result<(), Error>,
    {
        self.unit_sv = None;

        let result = f(self);

        let sync = if self.sync_pending && self.status == SessionStatus::Closed {
            self.sync_pending = false;
            match self.crypto.as_mut() {
                Some(c) => c.synchronize().map_err(crypto_err),
                None => Ok(()),
            }
        } else {
            Ok(())
        };

        match (result, sync) {
            (Err(e), Err(s)) => {
                warn!("crypto module synchronize failed after error: {s}");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(s)) => Err(s),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn open_session(&mut self, level: WriteAccessLevel) -> Result<(), Error> {
        if self.status != SessionStatus::Closed {
            return Err(StateError::SessionAlreadyOpen.into());
        }
        if self.crypto.is_none() {
            return Err(StateError::NoCryptoModule.into());
        }

        self.status = SessionStatus::Opening;
        let result = self.open_session_inner(level);
        if result.is_err() && self.status == SessionStatus::Opening {
            // nothing reached the card yet
            self.status = SessionStatus::Closed;
        }
        result
    }

    fn open_session_inner(&mut self, level: WriteAccessLevel) -> Result<(), Error> {
        // A queued PIN verification must lead the unit and complete
        // before the session opens
        if let Some(i) = self
            .queue
            .iter()
            .position(|op| matches!(op, CardOperation::VerifyPin { .. }))
        {
            if i != 0 {
                return Err(StateError::PinNotFirst.into());
            }
            let op = self.queue.remove(0);
            let mut pending = Pending::default();
            self.execute_op(&op, 0, &mut pending)?;
            self.flush_pending(&mut pending)?;
        }

        let merged = if self.settings.read_on_session_opening {
            self.take_merge_read()
        } else {
            None
        };

        let challenge = self.crypto_init_context()?;

        // Pre-computed opening only applies under extended mode at the
        // same write-access level; otherwise fall back to the cold path
        let pre = match self.pre_open.take() {
            Some(p) if p.level == level && self.supports_extended_mode() => Some(p),
            Some(p) => {
                debug!("pre-open data not applicable, cold-opening");
                self.pre_open = Some(p);
                None
            }
            None => None,
        };
        if let Some(p) = &pre {
            self.crypto_init_mac(&p.data_out, p.kif, p.kvc)?;
        }

        let cmd = match merged {
            Some((sfi, record, _)) => OpenSession::with_read(level, challenge, sfi, record)?,
            None => OpenSession::new(level, challenge),
        };
        let req = cmd.request(self.cla());
        let resp = self.transmit_one(req.clone())?;
        let parsed = cmd
            .decode(&resp)
            .map_err(|e| Error::decode(Instruction::OpenSession, e))?;

        // The card-side session exists from here on, whatever follows
        self.status = SessionStatus::Open;
        self.image.open_session(SessionContext {
            level,
            transaction_counter: parsed.transaction_counter,
            previous_session_ratified: parsed.previous_session_ratified,
            kif: parsed.kif,
            kvc: parsed.kvc,
            exchanged: vec![req.to_bytes(), resp.to_bytes()],
        });

        match &pre {
            Some(p) => {
                if resp.data != p.data_out {
                    return Err(Error::AnticipatedMismatch);
                }
            }
            None => self.crypto_init_mac(&resp.data, parsed.kif, parsed.kvc)?,
        }

        if let Some((sfi, record, _)) = merged {
            if !parsed.record_data.is_empty() {
                self.image.put_record(sfi, record, parsed.record_data.clone());
            }
        }

        if !self.settings.is_session_key_authorized(parsed.kif, parsed.kvc) {
            return Err(Error::UnauthorizedKey {
                kif: parsed.kif,
                kvc: parsed.kvc,
            });
        }

        debug!(
            "secure session open (level {}, KIF {:#04x}, KVC {:#04x})",
            level, parsed.kif, parsed.kvc
        );

        self.drain_queue()
    }

    /// First queued operation when it is a read mergeable into the
    /// opening: a single-record read whose record number fits P1
    fn take_merge_read(&mut self) -> Option<(u8, u8, u8)> {
        match self.queue.first() {
            Some(CardOperation::ReadRecords {
                sfi,
                from_record,
                count: 1,
                record_size,
            }) if *from_record <= 0x1F => {
                let merged = (*sfi, *from_record, *record_size);
                self.queue.remove(0);
                Some(merged)
            }
            _ => None,
        }
    }

    fn close_session(&mut self) -> Result<(), Error> {
        if self.status != SessionStatus::Open {
            return Err(StateError::NoSession.into());
        }

        self.drain_queue()?;

        self.status = SessionStatus::Closing;
        self.mac_flush()?;
        let signature = self.crypto_finalize()?;

        let cmd = CloseSession::new(signature, self.settings.ratify_on_close);
        let req = cmd.request(self.cla());
        let resp = self.transmit_one(req)?;
        let card_sig = match cmd.decode(&resp) {
            Ok(sig) => sig,
            Err(e) => {
                // The card refused the close; the session is still open
                // on its side and the caller decides what happens next
                self.status = SessionStatus::Open;
                return Err(Error::decode(Instruction::CloseSession, e));
            }
        };

        self.status = SessionStatus::Closed;
        self.image.close_session();

        if !self.crypto_verify(&card_sig)? {
            return Err(Error::InvalidCardMac);
        }

        debug!("secure session closed and authenticated");
        Ok(())
    }

    fn abort_session(&mut self) -> Result<(), Error> {
        self.status = SessionStatus::Aborting;

        let cmd = AbortSession;
        let req = cmd.request(self.cla());
        let result = self.transmit_one(req).and_then(|resp| {
            cmd.decode(&resp)
                .map_err(|e| Error::decode(Instruction::CloseSession, e))
        });

        // Local state resets even when the card had no session to abort
        self.status = SessionStatus::Closed;
        self.image.close_session();
        self.mac_pending.clear();

        result
    }

    // --- batcher ---

    fn drain_queue(&mut self) -> Result<(), Error> {
        if self.queue.is_empty() {
            return Ok(());
        }

        let ops = mem::take(&mut self.queue);
        let mut pending = Pending::default();

        for (i, op) in ops.iter().enumerate() {
            if let Err(e) = self.execute_op(op, i, &mut pending) {
                // Abort the remainder; whatever never reached the wire
                // stays prepared for the caller
                let attempted = pending.attempted_op.map(|a| a >= i).unwrap_or(false);
                let restore = pending
                    .first_op
                    .unwrap_or(if attempted { i + 1 } else { i });
                self.queue = ops[restore..].to_vec();
                return Err(e);
            }
        }

        self.flush_pending(&mut pending)
    }

    fn execute_op(
        &mut self,
        op: &CardOperation,
        op_index: usize,
        pending: &mut Pending,
    ) -> Result<(), Error> {
        let capacity = self.capacity();

        match op {
            CardOperation::SelectFile(sel) => {
                self.push_command(pending, op_index, PlannedCommand::SelectFile(*sel))
            }

            CardOperation::GetData(tag) => {
                self.push_command(pending, op_index, PlannedCommand::GetData(GetData { tag: *tag }))
            }

            CardOperation::ReadRecords {
                sfi,
                from_record,
                count,
                record_size,
            } => {
                for (from, n) in record_runs(*from_record, *count, *record_size, capacity) {
                    let cmd = ReadRecords::new(*sfi, from, n, *record_size)?;
                    self.push_command(pending, op_index, PlannedCommand::ReadRecords(cmd))?;
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
                for (from, n) in record_runs(*from_record, *count, *length, capacity) {
                    let cmd = ReadRecordsPartially::new(*sfi, from, n, *offset, *length)?;
                    self.push_command(pending, op_index, PlannedCommand::ReadRecordsPartially(cmd))?;
                }
                Ok(())
            }

            CardOperation::ReadBinary {
                sfi,
                offset,
                length,
            } => {
                let (pin, chunks) = binary_chunks(*sfi, *offset, *length, capacity);
                if pin {
                    let cmd = ReadBinary::new(*sfi, 0, 1)?;
                    self.push_command(pending, op_index, PlannedCommand::ReadBinary(cmd))?;
                }
                for c in chunks {
                    let cmd = ReadBinary::new(c.sfi, c.offset, c.len as u8)?;
                    self.push_command(pending, op_index, PlannedCommand::ReadBinary(cmd))?;
                }
                Ok(())
            }

            CardOperation::UpdateRecord { sfi, record, data } => {
                let cmd = UpdateRecord::new(*sfi, *record, data.clone())?;
                self.push_command(pending, op_index, PlannedCommand::UpdateRecord(cmd))
            }

            CardOperation::WriteRecord { sfi, record, data } => {
                let cmd = WriteRecord::new(*sfi, *record, data.clone())?;
                self.push_command(pending, op_index, PlannedCommand::WriteRecord(cmd))
            }

            CardOperation::UpdateBinary { sfi, offset, data } => {
                let (pin, chunks) = binary_chunks(*sfi, *offset, data.len(), capacity);
                if pin {
                    let cmd = ReadBinary::new(*sfi, 0, 1)?;
                    self.push_command(pending, op_index, PlannedCommand::ReadBinary(cmd))?;
                }
                for c in chunks {
                    let slice = data[c.offset - *offset..c.offset - *offset + c.len].to_vec();
                    let cmd = UpdateBinary::new(c.sfi, c.offset, slice)?;
                    self.push_command(pending, op_index, PlannedCommand::UpdateBinary(cmd))?;
                }
                Ok(())
            }

            CardOperation::WriteBinary { sfi, offset, data } => {
                let (pin, chunks) = binary_chunks(*sfi, *offset, data.len(), capacity);
                if pin {
                    let cmd = ReadBinary::new(*sfi, 0, 1)?;
                    self.push_command(pending, op_index, PlannedCommand::ReadBinary(cmd))?;
                }
                for c in chunks {
                    let slice = data[c.offset - *offset..c.offset - *offset + c.len].to_vec();
                    let cmd = WriteBinary::new(c.sfi, c.offset, slice)?;
                    self.push_command(pending, op_index, PlannedCommand::WriteBinary(cmd))?;
                }
                Ok(())
            }

            CardOperation::IncreaseCounter {
                sfi,
                counter,
                value,
            } => {
                let cmd = AdjustCounter::new(CounterDirection::Increase, *sfi, *counter, *value)?;
                self.push_command(pending, op_index, PlannedCommand::AdjustCounter(cmd))
            }

            CardOperation::DecreaseCounter {
                sfi,
                counter,
                value,
            } => {
                let cmd = AdjustCounter::new(CounterDirection::Decrease, *sfi, *counter, *value)?;
                self.push_command(pending, op_index, PlannedCommand::AdjustCounter(cmd))
            }

            CardOperation::IncreaseCounters { sfi, items } => {
                self.push_counters(pending, op_index, CounterDirection::Increase, *sfi, items)
            }

            CardOperation::DecreaseCounters { sfi, items } => {
                self.push_counters(pending, op_index, CounterDirection::Decrease, *sfi, items)
            }

            CardOperation::SetCounter {
                sfi,
                counter,
                target,
            } => {
                // Flush first so the image holds the freshest value
                self.flush_pending(pending)?;
                let current =
                    self.image
                        .counter(*sfi, *counter)
                        .ok_or(StateError::CounterNotRead {
                            sfi: *sfi,
                            counter: *counter,
                        })?;

                let (direction, delta) = if *target >= current {
                    (CounterDirection::Increase, *target - current)
                } else {
                    (CounterDirection::Decrease, current - *target)
                };
                if delta == 0 {
                    trace!("counter {counter} of {sfi:#04x} already at target");
                    return Ok(());
                }

                let cmd = AdjustCounter::new(direction, *sfi, *counter, delta)?;
                self.push_command(pending, op_index, PlannedCommand::AdjustCounter(cmd))
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
                let cmd = SearchRecords::new(
                    *sfi,
                    *from_record,
                    *offset,
                    search_flags(*repeated_offset, *fetch_first),
                    data.clone(),
                    mask.clone(),
                )?;
                self.push_command(pending, op_index, PlannedCommand::SearchRecords(cmd))
            }

            CardOperation::VerifyPin { pin } => {
                if self.settings.plain_pin_transmission {
                    self.push_command(pending, op_index, PlannedCommand::VerifyPin(VerifyPin::Plain(pin.clone())))
                } else {
                    // Fresh challenge, then the ciphered presentation
                    self.flush_pending(pending)?;
                    let challenge = self.get_card_challenge()?;
                    self.mac_flush()?;
                    let key = self.settings.pin_verification_key;
                    let block = self.crypto_cipher_pin_presentation(&challenge, pin, key)?;
                    self.push_command(pending, op_index, PlannedCommand::VerifyPin(VerifyPin::Ciphered(block)))
                }
            }

            CardOperation::CheckPinStatus => {
                self.push_command(pending, op_index, PlannedCommand::VerifyPin(VerifyPin::Status))
            }

            CardOperation::SvGet { operation } => {
                let cmd = SvGet::new(operation.get_variant());
                self.push_command(pending, op_index, PlannedCommand::SvGet(cmd))
            }

            CardOperation::SvReload {
                amount,
                date,
                time,
                free,
            } => {
                let cmd = SvReload::new(*amount, *date, *time, *free)?;
                self.authorize_sv(pending, SvOperation::Reload)?;
                self.push_command(pending, op_index, PlannedCommand::SvReload(cmd))
            }

            CardOperation::SvDebit { amount, date, time } => {
                let cmd = SvDebit::new(*amount, *date, *time)?;
                self.authorize_sv(pending, SvOperation::Debit)?;
                self.push_command(pending, op_index, PlannedCommand::SvDebit(cmd))
            }

            CardOperation::SvUndebit { amount, date, time } => {
                let cmd = SvDebit::undebit(*amount, *date, *time)?;
                self.authorize_sv(pending, SvOperation::Undebit)?;
                self.push_command(pending, op_index, PlannedCommand::SvDebit(cmd))
            }

            CardOperation::Invalidate => {
                if self.image.is_invalidated() {
                    return Err(StateError::AlreadyInvalidated.into());
                }
                self.push_command(pending, op_index, PlannedCommand::Invalidate(Invalidate))
            }

            CardOperation::Rehabilitate => {
                if !self.image.is_invalidated() {
                    return Err(StateError::NotInvalidated.into());
                }
                self.push_command(pending, op_index, PlannedCommand::Rehabilitate(Rehabilitate))
            }
        }
    }

    /// Counter batches: one multiple-counter command per capacity run
    /// where the product supports it, one single-counter exchange per
    /// entry elsewhere
    fn push_counters(
        &mut self,
        pending: &mut Pending,
        op_index: usize,
        direction: CounterDirection,
        sfi: u8,
        items: &[(u8, u32)],
    ) -> Result<(), Error> {
        if self.image.profile().supports(CardFeatures::MULTIPLE_COUNTERS) {
            let per = (self.capacity() / 4).max(1);
            for chunk in items.chunks(per) {
                let cmd = AdjustCounters::new(direction, sfi, chunk.to_vec())?;
                self.push_command(pending, op_index, PlannedCommand::AdjustCounters(cmd))?;
            }
            Ok(())
        } else {
            for (counter, value) in items {
                let cmd = AdjustCounter::new(direction, sfi, *counter, *value)?;
                self.flush_pending(pending)?;
                self.push_command(pending, op_index, PlannedCommand::AdjustCounter(cmd))?;
                self.flush_pending(pending)?;
            }
            Ok(())
        }
    }

    /// Consult the crypto module before a stored value modification
    fn authorize_sv(&mut self, pending: &mut Pending, operation: SvOperation) -> Result<(), Error> {
        // The SV Get must have hit the wire before the check
        self.flush_pending(pending)?;

        let (variant, req, resp) = self
            .unit_sv
            .clone()
            .ok_or(StateError::SvGetMissing)?;
        if variant != operation.get_variant() {
            return Err(StateError::SvGetMissing.into());
        }

        self.mac_flush()?;
        if !self.crypto_sv_check(&req, &resp)? {
            return Err(Error::SvRefused);
        }
        Ok(())
    }

    fn push_command(
        &mut self,
        pending: &mut Pending,
        op_index: usize,
        cmd: PlannedCommand,
    ) -> Result<(), Error> {
        let body = cmd.request(self.cla()).body_len();
        if !pending.group.is_empty() && pending.body + body > self.capacity() {
            self.flush_pending(pending)?;
        }
        pending.body += body;
        pending.first_op.get_or_insert(op_index);
        pending.group_last_op = Some(op_index);
        pending.group.push(cmd);
        Ok(())
    }

    /// Send the accumulated group as one exchange plan and fold every
    /// response into the image before anything further is built
    fn flush_pending(&mut self, pending: &mut Pending) -> Result<(), Error> {
        if pending.group.is_empty() {
            return Ok(());
        }

        let group = mem::take(&mut pending.group);
        pending.body = 0;
        pending.first_op = None;
        pending.attempted_op = pending.group_last_op.take();

        let requests: Vec<ApduRequest> = group.iter().map(|c| c.request(self.cla())).collect();
        let responses = self.transmit_group(&requests)?;

        for ((cmd, req), resp) in group.iter().zip(&requests).zip(&responses) {
            if self.status == SessionStatus::Open {
                self.mac_feed(req, resp)?;
            }
            cmd.apply(resp, &mut self.image)?;
            if let PlannedCommand::SvGet(get) = cmd {
                self.unit_sv = Some((get.variant(), req.to_bytes(), resp.to_bytes()));
            }
        }
        Ok(())
    }

    // --- card exchanges ---

    fn cla(&self) -> u8 {
        self.image.profile().cla
    }

    fn capacity(&self) -> usize {
        self.image.profile().payload_capacity
    }

    fn transmit_group(&mut self, requests: &[ApduRequest]) -> Result<Vec<ApduResponse>, Error> {
        for req in requests {
            debug!("> {}", hex::encode(req.to_bytes()));
        }

        let responses = self
            .transport
            .transmit(requests)
            .map_err(|e| Error::CardComm(Box::new(e)))?;

        if responses.len() != requests.len() {
            return Err(Error::ResponseCount {
                sent: requests.len(),
                received: responses.len(),
            });
        }

        for resp in &responses {
            debug!("< {}", hex::encode(resp.to_bytes()));
        }
        Ok(responses)
    }

    fn transmit_one(&mut self, request: ApduRequest) -> Result<ApduResponse, Error> {
        let mut responses = self.transmit_group(std::slice::from_ref(&request))?;
        Ok(responses.remove(0))
    }

    fn get_card_challenge(&mut self) -> Result<[u8; CHALLENGE_LEN], Error> {
        let cmd = GetChallenge;
        let req = cmd.request(self.cla());
        let resp = self.transmit_one(req.clone())?;
        if self.status == SessionStatus::Open {
            self.mac_feed(&req, &resp)?;
        }
        cmd.decode(&resp)
            .map_err(|e| Error::decode(Instruction::GetChallenge, e))
    }

    // --- session MAC bookkeeping ---

    fn mac_batched(&self) -> bool {
        self.crypto
            .as_ref()
            .map(|c| c.supports_multiple_update())
            .unwrap_or(false)
    }

    fn supports_extended_mode(&self) -> bool {
        self.crypto
            .as_ref()
            .map(|c| c.supports_extended_mode())
            .unwrap_or(false)
    }

    /// Forward one exchange to the running session MAC, request first
    fn mac_feed(&mut self, req: &ApduRequest, resp: &ApduResponse) -> Result<(), Error> {
        let req_bytes = req.to_bytes();
        let resp_bytes = resp.to_bytes();

        if let Some(ctx) = self.image.session_mut() {
            ctx.exchanged.push(req_bytes.clone());
            ctx.exchanged.push(resp_bytes.clone());
        }

        if self.mac_batched() {
            trace!("buffering session MAC update pair");
            self.mac_pending.push(req_bytes);
            self.mac_pending.push(resp_bytes);
            Ok(())
        } else {
            self.crypto_update(&req_bytes)?;
            self.crypto_update(&resp_bytes)
        }
    }

    /// Coalesce buffered MAC updates into one crypto-module call
    fn mac_flush(&mut self) -> Result<(), Error> {
        if self.mac_pending.is_empty() {
            return Ok(());
        }
        let updates = mem::take(&mut self.mac_pending);
        trace!("flushing {} buffered MAC updates", updates.len());
        self.crypto_update_multiple(&updates)
    }

    // --- crypto module calls ---

    fn require_feature(&self, features: CardFeatures, name: &'static str) -> Result<(), Error> {
        if self.image.profile().supports(features) {
            Ok(())
        } else {
            Err(StateError::UnsupportedFeature(name).into())
        }
    }

    fn crypto_mut(&mut self) -> Result<&mut C, Error> {
        self.sync_pending = true;
        self.crypto
            .as_mut()
            .ok_or_else(|| StateError::NoCryptoModule.into())
    }

    fn crypto_init_context(&mut self) -> Result<[u8; CHALLENGE_LEN], Error> {
        self.crypto_mut()?
            .init_terminal_secure_session_context()
            .map_err(crypto_err)
    }

    fn crypto_init_mac(&mut self, data_out: &[u8], kif: u8, kvc: u8) -> Result<(), Error> {
        self.crypto_mut()?
            .init_terminal_session_mac(data_out, kif, kvc)
            .map_err(crypto_err)
    }

    fn crypto_update(&mut self, apdu: &[u8]) -> Result<(), Error> {
        self.crypto_mut()?
            .update_terminal_session_mac(apdu)
            .map_err(crypto_err)
    }

    fn crypto_update_multiple(&mut self, apdus: &[Vec<u8>]) -> Result<(), Error> {
        self.crypto_mut()?
            .update_terminal_session_mac_multiple(apdus)
            .map_err(crypto_err)
    }

    fn crypto_finalize(&mut self) -> Result<[u8; SIGNATURE_LEN], Error> {
        self.crypto_mut()?
            .finalize_terminal_session_mac()
            .map_err(crypto_err)
    }

    fn crypto_verify(&mut self, card_sig: &[u8; SIGNATURE_LEN]) -> Result<bool, Error> {
        self.crypto_mut()?
            .is_card_session_mac_valid(card_sig)
            .map_err(crypto_err)
    }

    fn crypto_cipher_pin_presentation(
        &mut self,
        challenge: &[u8; CHALLENGE_LEN],
        pin: &PinData,
        key: KeyRef,
    ) -> Result<[u8; CIPHERED_PIN_LEN], Error> {
        self.crypto_mut()?
            .cipher_pin_for_presentation(challenge, pin, key)
            .map_err(crypto_err)
    }

    fn crypto_cipher_pin_modification(
        &mut self,
        challenge: &[u8; CHALLENGE_LEN],
        current_pin: Option<&PinData>,
        new_pin: &PinData,
        key: KeyRef,
    ) -> Result<[u8; CIPHERED_PIN_CHANGE_LEN], Error> {
        self.crypto_mut()?
            .cipher_pin_for_modification(challenge, current_pin, new_pin, key)
            .map_err(crypto_err)
    }

    fn crypto_generate_key(
        &mut self,
        challenge: &[u8; CHALLENGE_LEN],
        issuer_key: KeyRef,
        new_key: KeyRef,
    ) -> Result<[u8; KEY_CRYPTOGRAM_LEN], Error> {
        self.crypto_mut()?
            .generate_ciphered_card_key(challenge, issuer_key, new_key)
            .map_err(crypto_err)
    }

    fn crypto_sv_check(&mut self, request: &[u8], response: &[u8]) -> Result<bool, Error> {
        self.crypto_mut()?
            .sv_check(request, response)
            .map_err(crypto_err)
    }

    fn check_sv_ordering(&self, operation: SvOperation) -> Result<(), Error> {
        self.require_feature(CardFeatures::STORED_VALUE, "stored value")?;
        if self.crypto.is_none() {
            return Err(StateError::NoCryptoModule.into());
        }

        let mut get_variant = None;
        for queued in &self.queue {
            match queued {
                CardOperation::SvGet { operation } => {
                    get_variant = Some(operation.get_variant());
                }
                CardOperation::SvReload { .. }
                | CardOperation::SvDebit { .. }
                | CardOperation::SvUndebit { .. } => {
                    return Err(StateError::SvOperationAlreadyPrepared.into());
                }
                _ => {}
            }
        }

        if get_variant != Some(operation.get_variant()) {
            return Err(StateError::SvGetMissing.into());
        }
        Ok(())
    }
}

fn crypto_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> Error {
    Error::CryptoComm(Box::new(e))
}
