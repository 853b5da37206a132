// Copyright (c) 2023-2024 The calypso-tx Authors

//! Crypto module boundary
//!
//! The trust anchor holding the session keys. SAM-backed and software
//! implementations expose the same call contract and differ only through
//! the capability flags; the session coordinator queries those instead of
//! inspecting types.
//!
//! Call ordering within a processing unit is part of the contract: the
//! coordinator initializes the session MAC from the open-session data,
//! feeds every subsequent exchange (request first, then response) into
//! the running digest, finalizes, verifies the card's signature, and ends
//! with exactly one `synchronize` once the session no longer spans
//! processing units.

use calypso_apdu::key::KeyRef;
use calypso_apdu::pin::{PinData, CIPHERED_PIN_CHANGE_LEN, CIPHERED_PIN_LEN};
use calypso_apdu::session::{CHALLENGE_LEN, SIGNATURE_LEN};

/// Ciphered key block length produced for CHANGE KEY
pub const KEY_CRYPTOGRAM_LEN: usize = calypso_apdu::key::KEY_CRYPTOGRAM_LEN;

/// Crypto module capability contract
pub trait CryptoModule {
    /// Implementation-specific communication error
    type Error: std::error::Error + Send + Sync + 'static;

    /// Produce the terminal challenge opening a secure session context
    fn init_terminal_secure_session_context(
        &mut self,
    ) -> Result<[u8; CHALLENGE_LEN], Self::Error>;

    /// Seed the terminal session MAC from the open-session data-out and
    /// the session key reference the card selected
    fn init_terminal_session_mac(
        &mut self,
        open_data_out: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<(), Self::Error>;

    /// Fold one raw APDU into the running session MAC
    fn update_terminal_session_mac(&mut self, apdu: &[u8]) -> Result<(), Self::Error>;

    /// Fold several raw APDUs into the running session MAC in one call;
    /// only invoked when [`supports_multiple_update`][Self::supports_multiple_update]
    /// reports true
    fn update_terminal_session_mac_multiple(
        &mut self,
        apdus: &[Vec<u8>],
    ) -> Result<(), Self::Error> {
        for apdu in apdus {
            self.update_terminal_session_mac(apdu)?;
        }
        Ok(())
    }

    /// Close the running digest and produce the terminal signature
    fn finalize_terminal_session_mac(&mut self) -> Result<[u8; SIGNATURE_LEN], Self::Error>;

    /// Verify the card's session signature
    fn is_card_session_mac_valid(
        &mut self,
        card_mac: &[u8; SIGNATURE_LEN],
    ) -> Result<bool, Self::Error>;

    /// Cipher a PIN for presentation against a card challenge
    fn cipher_pin_for_presentation(
        &mut self,
        challenge: &[u8; CHALLENGE_LEN],
        pin: &PinData,
        key: KeyRef,
    ) -> Result<[u8; CIPHERED_PIN_LEN], Self::Error>;

    /// Cipher a PIN change block against a card challenge
    fn cipher_pin_for_modification(
        &mut self,
        challenge: &[u8; CHALLENGE_LEN],
        current_pin: Option<&PinData>,
        new_pin: &PinData,
        key: KeyRef,
    ) -> Result<[u8; CIPHERED_PIN_CHANGE_LEN], Self::Error>;

    /// Generate the ciphered key block written by CHANGE KEY
    fn generate_ciphered_card_key(
        &mut self,
        challenge: &[u8; CHALLENGE_LEN],
        issuer_key: KeyRef,
        new_key: KeyRef,
    ) -> Result<[u8; KEY_CRYPTOGRAM_LEN], Self::Error>;

    /// Authorize a stored value operation from the SV Get exchange
    fn sv_check(&mut self, request: &[u8], response: &[u8]) -> Result<bool, Self::Error>;

    /// Commit / flush module state at the end of a processing unit
    fn synchronize(&mut self) -> Result<(), Self::Error>;

    /// Whether MAC updates may be batched into one call
    fn supports_multiple_update(&self) -> bool {
        false
    }

    /// Whether the module supports extended mode, a prerequisite of the
    /// pre-open optimization
    fn supports_extended_mode(&self) -> bool {
        false
    }
}

/// Placeholder module for plaintext-only transactions
///
/// Every call fails; the engine never reaches them without a configured
/// module.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoCrypto;

/// Error raised when a [`NoCrypto`] placeholder is exercised
#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("no crypto module configured")]
pub struct NoCryptoError;

impl CryptoModule for NoCrypto {
    type Error = NoCryptoError;

    fn init_terminal_secure_session_context(
        &mut self,
    ) -> Result<[u8; CHALLENGE_LEN], Self::Error> {
        Err(NoCryptoError)
    }

    fn init_terminal_session_mac(
        &mut self,
        _open_data_out: &[u8],
        _kif: u8,
        _kvc: u8,
    ) -> Result<(), Self::Error> {
        Err(NoCryptoError)
    }

    fn update_terminal_session_mac(&mut self, _apdu: &[u8]) -> Result<(), Self::Error> {
        Err(NoCryptoError)
    }

    fn finalize_terminal_session_mac(&mut self) -> Result<[u8; SIGNATURE_LEN], Self::Error> {
        Err(NoCryptoError)
    }

    fn is_card_session_mac_valid(
        &mut self,
        _card_mac: &[u8; SIGNATURE_LEN],
    ) -> Result<bool, Self::Error> {
        Err(NoCryptoError)
    }

    fn cipher_pin_for_presentation(
        &mut self,
        _challenge: &[u8; CHALLENGE_LEN],
        _pin: &PinData,
        _key: KeyRef,
    ) -> Result<[u8; CIPHERED_PIN_LEN], Self::Error> {
        Err(NoCryptoError)
    }

    fn cipher_pin_for_modification(
        &mut self,
        _challenge: &[u8; CHALLENGE_LEN],
        _current_pin: Option<&PinData>,
        _new_pin: &PinData,
        _key: KeyRef,
    ) -> Result<[u8; CIPHERED_PIN_CHANGE_LEN], Self::Error> {
        Err(NoCryptoError)
    }

    fn generate_ciphered_card_key(
        &mut self,
        _challenge: &[u8; CHALLENGE_LEN],
        _issuer_key: KeyRef,
        _new_key: KeyRef,
    ) -> Result<[u8; KEY_CRYPTOGRAM_LEN], Self::Error> {
        Err(NoCryptoError)
    }

    fn sv_check(&mut self, _request: &[u8], _response: &[u8]) -> Result<bool, Self::Error> {
        Err(NoCryptoError)
    }

    fn synchronize(&mut self) -> Result<(), Self::Error> {
        Err(NoCryptoError)
    }
}
