// Copyright (c) 2023-2024 The calypso-tx Authors

//! Security settings applied by the session coordinator and the PIN /
//! key sub-protocols

use calypso_apdu::key::KeyRef;

/// Policy and sub-protocol configuration
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SecuritySettings {
    /// Session key pairs accepted at opening; empty accepts any key
    pub authorized_session_keys: Vec<KeyRef>,
    /// Opt-in for plaintext PIN transmission
    pub plain_pin_transmission: bool,
    /// Key ciphering PIN presentations
    pub pin_verification_key: KeyRef,
    /// Key ciphering PIN modifications
    pub pin_modification_key: KeyRef,
    /// Merge an eligible first read into the open-session exchange
    pub read_on_session_opening: bool,
    /// Request immediate ratification on close
    pub ratify_on_close: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            authorized_session_keys: Vec::new(),
            plain_pin_transmission: false,
            pin_verification_key: KeyRef::new(0x00, 0x00),
            pin_modification_key: KeyRef::new(0x00, 0x00),
            read_on_session_opening: true,
            ratify_on_close: true,
        }
    }
}

impl SecuritySettings {
    /// Whether a session key pair is acceptable under the policy
    pub fn is_session_key_authorized(&self, kif: u8, kvc: u8) -> bool {
        self.authorized_session_keys.is_empty()
            || self
                .authorized_session_keys
                .iter()
                .any(|k| k.kif == kif && k.kvc == kvc)
    }
}
