#![allow(unused)]
// Copyright (c) 2023-2024 The calypso-tx Authors

//! Scripted card transport and crypto module sharing one event log, so
//! tests assert the exact card / crypto-module interleaving

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use calypso_tx::apdu::key::KeyRef;
use calypso_tx::apdu::pin::{PinData, CIPHERED_PIN_CHANGE_LEN, CIPHERED_PIN_LEN};
use calypso_tx::apdu::session::{CHALLENGE_LEN, SIGNATURE_LEN};
use calypso_tx::apdu::{ApduRequest, ApduResponse};
use calypso_tx::crypto::KEY_CRYPTOGRAM_LEN;
use calypso_tx::{CardProfile, CardTransport, CryptoModule, ProductType};

pub const TERMINAL_CHALLENGE: [u8; CHALLENGE_LEN] = [0x11; CHALLENGE_LEN];
pub const TERMINAL_SIGNATURE: [u8; SIGNATURE_LEN] = [0xA0; SIGNATURE_LEN];
pub const CARD_SIGNATURE: [u8; SIGNATURE_LEN] = [0xB1; SIGNATURE_LEN];
pub const CIPHERED_PIN: [u8; CIPHERED_PIN_LEN] = [0xC1; CIPHERED_PIN_LEN];
pub const CIPHERED_PIN_CHANGE: [u8; CIPHERED_PIN_CHANGE_LEN] = [0xD2; CIPHERED_PIN_CHANGE_LEN];
pub const KEY_CRYPTOGRAM: [u8; KEY_CRYPTOGRAM_LEN] = [0x5A; KEY_CRYPTOGRAM_LEN];

/// Interleaved record of card exchanges and crypto-module calls
pub type EventLog = Rc<RefCell<Vec<String>>>;

pub fn new_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.borrow().clone()
}

pub fn setup_logging() {
    let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, Default::default());
}

#[derive(Debug, thiserror::Error)]
#[error("transport script exhausted")]
pub struct ScriptExhausted;

/// Card transport answering from a script of response groups
pub struct MockTransport {
    log: EventLog,
    responses: Rc<RefCell<VecDeque<Vec<ApduResponse>>>>,
    pub sent: Rc<RefCell<Vec<Vec<ApduRequest>>>>,
}

impl MockTransport {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            responses: Rc::new(RefCell::new(VecDeque::new())),
            sent: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Queue the responses for the next transmitted group
    pub fn script(&self, group: Vec<ApduResponse>) {
        self.responses.borrow_mut().push_back(group);
    }

    /// Everything transmitted so far, one entry per group
    pub fn sent(&self) -> Rc<RefCell<Vec<Vec<ApduRequest>>>> {
        self.sent.clone()
    }
}

impl CardTransport for MockTransport {
    type Error = ScriptExhausted;

    fn transmit(&mut self, requests: &[ApduRequest]) -> Result<Vec<ApduResponse>, Self::Error> {
        let instructions: Vec<String> = requests
            .iter()
            .map(|r| format!("{:02x}", r.ins.ins()))
            .collect();
        self.log
            .borrow_mut()
            .push(format!("card[{}]", instructions.join(",")));
        self.sent.borrow_mut().push(requests.to_vec());

        self.responses.borrow_mut().pop_front().ok_or(ScriptExhausted)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("mock crypto failure")]
pub struct MockCryptoError;

/// Crypto module returning canned material and recording every call
pub struct MockCrypto {
    log: EventLog,
    pub multiple_update: bool,
    pub extended_mode: bool,
    pub card_mac_valid: bool,
    pub sv_authorized: bool,
}

impl MockCrypto {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            multiple_update: false,
            extended_mode: false,
            card_mac_valid: true,
            sv_authorized: true,
        }
    }

    fn record(&self, event: &str) {
        self.log.borrow_mut().push(event.to_string());
    }
}

impl CryptoModule for MockCrypto {
    type Error = MockCryptoError;

    fn init_terminal_secure_session_context(
        &mut self,
    ) -> Result<[u8; CHALLENGE_LEN], Self::Error> {
        self.record("init-context");
        Ok(TERMINAL_CHALLENGE)
    }

    fn init_terminal_session_mac(
        &mut self,
        _open_data_out: &[u8],
        _kif: u8,
        _kvc: u8,
    ) -> Result<(), Self::Error> {
        self.record("init-mac");
        Ok(())
    }

    fn update_terminal_session_mac(&mut self, _apdu: &[u8]) -> Result<(), Self::Error> {
        self.record("update");
        Ok(())
    }

    fn update_terminal_session_mac_multiple(
        &mut self,
        apdus: &[Vec<u8>],
    ) -> Result<(), Self::Error> {
        self.record(&format!("update-multiple({})", apdus.len()));
        Ok(())
    }

    fn finalize_terminal_session_mac(&mut self) -> Result<[u8; SIGNATURE_LEN], Self::Error> {
        self.record("finalize");
        Ok(TERMINAL_SIGNATURE)
    }

    fn is_card_session_mac_valid(
        &mut self,
        _card_mac: &[u8; SIGNATURE_LEN],
    ) -> Result<bool, Self::Error> {
        self.record("verify");
        Ok(self.card_mac_valid)
    }

    fn cipher_pin_for_presentation(
        &mut self,
        _challenge: &[u8; CHALLENGE_LEN],
        _pin: &PinData,
        _key: KeyRef,
    ) -> Result<[u8; CIPHERED_PIN_LEN], Self::Error> {
        self.record("cipher-pin");
        Ok(CIPHERED_PIN)
    }

    fn cipher_pin_for_modification(
        &mut self,
        _challenge: &[u8; CHALLENGE_LEN],
        _current_pin: Option<&PinData>,
        _new_pin: &PinData,
        _key: KeyRef,
    ) -> Result<[u8; CIPHERED_PIN_CHANGE_LEN], Self::Error> {
        self.record("cipher-pin-change");
        Ok(CIPHERED_PIN_CHANGE)
    }

    fn generate_ciphered_card_key(
        &mut self,
        _challenge: &[u8; CHALLENGE_LEN],
        _issuer_key: KeyRef,
        _new_key: KeyRef,
    ) -> Result<[u8; KEY_CRYPTOGRAM_LEN], Self::Error> {
        self.record("generate-key");
        Ok(KEY_CRYPTOGRAM)
    }

    fn sv_check(&mut self, _request: &[u8], _response: &[u8]) -> Result<bool, Self::Error> {
        self.record("sv-check");
        Ok(self.sv_authorized)
    }

    fn synchronize(&mut self) -> Result<(), Self::Error> {
        self.record("synchronize");
        Ok(())
    }

    fn supports_multiple_update(&self) -> bool {
        self.multiple_update
    }

    fn supports_extended_mode(&self) -> bool {
        self.extended_mode
    }
}

// --- fixtures ---

pub fn rev3() -> CardProfile {
    CardProfile::for_product(ProductType::PrimeRevision3)
}

pub fn rev3_cap(payload_capacity: usize) -> CardProfile {
    let mut profile = rev3();
    profile.payload_capacity = payload_capacity;
    profile
}

pub fn rev2() -> CardProfile {
    CardProfile::for_product(ProductType::PrimeRevision2)
}

pub fn ok(data_hex: &str) -> ApduResponse {
    ApduResponse::new(hex::decode(data_hex).unwrap(), 0x9000)
}

pub fn sw(code: u16) -> ApduResponse {
    ApduResponse::new(vec![], code)
}

/// Open-session response: transaction counter 0x000342, then
/// ratification, key reference and the optional merged record data
pub fn open_resp(ratified: bool, kif: u8, kvc: u8, record_hex: &str) -> ApduResponse {
    let record = hex::decode(record_hex).unwrap();
    let mut data = vec![
        0x00,
        0x03,
        0x42,
        if ratified { 0x00 } else { 0x01 },
        kif,
        kvc,
        record.len() as u8,
    ];
    data.extend_from_slice(&record);
    ApduResponse::new(data, 0x9000)
}

pub fn close_resp() -> ApduResponse {
    ApduResponse::new(CARD_SIGNATURE.to_vec(), 0x9000)
}

/// Hex of every request in a transmitted group
pub fn group_hex(sent: &Rc<RefCell<Vec<Vec<ApduRequest>>>>, group: usize) -> Vec<String> {
    sent.borrow()[group]
        .iter()
        .map(|r| hex::encode(r.to_bytes()))
        .collect()
}
