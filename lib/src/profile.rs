// Copyright (c) 2023-2024 The calypso-tx Authors

//! Card profiles, resolved once from the startup information
//!
//! The profile is the closed set of product variants the engine dispatches
//! on: payload capacity, feature flags, and command-shape differences
//! (Prime revision 2 keeps the legacy class byte).

use calypso_apdu::{ApduError, CLA_ISO, CLA_LEGACY};

/// Product family variants
#[derive(Copy, Clone, PartialEq, Eq, Debug, strum::Display)]
pub enum ProductType {
    PrimeRevision2,
    PrimeRevision3,
    Light,
}

bitflags::bitflags! {
    /// Feature set advertised by a product
    pub struct CardFeatures: u8 {
        /// INCREASE MULTIPLE / DECREASE MULTIPLE commands
        const MULTIPLE_COUNTERS = 0x01;
        /// SEARCH RECORD command
        const RECORD_SEARCH = 0x02;
        /// Stored value sub-protocol
        const STORED_VALUE = 0x04;
        /// PIN sub-protocol
        const PIN = 0x08;
        /// Extended-mode sessions, prerequisite of pre-opening
        const EXTENDED_MODE = 0x10;
    }
}

/// 7-byte startup information blob
///
/// ## Encoding:
/// buffer size indicator, platform, application type, application
/// subtype, software issuer, software version, software revision
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct StartupInfo {
    pub buffer_size_indicator: u8,
    pub platform: u8,
    pub application_type: u8,
    pub application_subtype: u8,
    pub software_issuer: u8,
    pub software_version: u8,
    pub software_revision: u8,
}

impl StartupInfo {
    pub fn parse(data: &[u8]) -> Result<Self, ApduError> {
        if data.len() < 7 {
            return Err(ApduError::InvalidLength);
        }

        Ok(Self {
            buffer_size_indicator: data[0],
            platform: data[1],
            application_type: data[2],
            application_subtype: data[3],
            software_issuer: data[4],
            software_version: data[5],
            software_revision: data[6],
        })
    }

    /// Product family encoded in the application type byte
    pub fn product_type(&self) -> ProductType {
        if self.application_type & 0x20 != 0 {
            ProductType::PrimeRevision3
        } else if self.application_type & 0x04 != 0 {
            ProductType::Light
        } else {
            ProductType::PrimeRevision2
        }
    }

    /// Payload capacity encoded in the buffer size indicator
    pub fn payload_capacity(&self) -> usize {
        match self.buffer_size_indicator {
            0..=3 => 64,
            4..=5 => 128,
            6 => 215,
            _ => 250,
        }
    }
}

/// Resolved card profile
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CardProfile {
    pub product: ProductType,
    /// Payload capacity in bytes for combined command bodies
    pub payload_capacity: usize,
    pub features: CardFeatures,
    /// Class byte for every command APDU
    pub cla: u8,
}

impl CardProfile {
    /// Resolve a profile from parsed startup information
    pub fn resolve(info: &StartupInfo) -> Self {
        let mut profile = Self::for_product(info.product_type());
        profile.payload_capacity = info.payload_capacity();
        profile
    }

    /// Default profile for a product family
    pub fn for_product(product: ProductType) -> Self {
        let (payload_capacity, features, cla) = match product {
            ProductType::PrimeRevision3 => (
                250,
                CardFeatures::MULTIPLE_COUNTERS
                    | CardFeatures::RECORD_SEARCH
                    | CardFeatures::STORED_VALUE
                    | CardFeatures::PIN
                    | CardFeatures::EXTENDED_MODE,
                CLA_ISO,
            ),
            ProductType::PrimeRevision2 => (
                128,
                CardFeatures::STORED_VALUE | CardFeatures::PIN,
                CLA_LEGACY,
            ),
            ProductType::Light => (128, CardFeatures::PIN, CLA_ISO),
        };

        Self {
            product,
            payload_capacity,
            features,
            cla,
        }
    }

    pub fn supports(&self, features: CardFeatures) -> bool {
        self.features.contains(features)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rev3_resolution() {
        let info = StartupInfo::parse(&[0x07, 0x3C, 0x21, 0x00, 0x00, 0x01, 0x02]).unwrap();
        let profile = CardProfile::resolve(&info);

        assert_eq!(profile.product, ProductType::PrimeRevision3);
        assert_eq!(profile.payload_capacity, 250);
        assert_eq!(profile.cla, 0x00);
        assert!(profile.supports(CardFeatures::MULTIPLE_COUNTERS | CardFeatures::STORED_VALUE));
    }

    #[test]
    fn rev2_keeps_legacy_class() {
        let info = StartupInfo::parse(&[0x04, 0x3C, 0x02, 0x00, 0x00, 0x01, 0x02]).unwrap();
        let profile = CardProfile::resolve(&info);

        assert_eq!(profile.product, ProductType::PrimeRevision2);
        assert_eq!(profile.payload_capacity, 128);
        assert_eq!(profile.cla, 0x94);
        assert!(!profile.supports(CardFeatures::MULTIPLE_COUNTERS));
        assert!(!profile.supports(CardFeatures::RECORD_SEARCH));
    }

    #[test]
    fn light_has_no_stored_value() {
        let profile = CardProfile::for_product(ProductType::Light);
        assert!(!profile.supports(CardFeatures::STORED_VALUE));
        assert!(profile.supports(CardFeatures::PIN));
    }

    #[test]
    fn capacity_table() {
        for (ind, cap) in [(0u8, 64usize), (3, 64), (4, 128), (6, 215), (7, 250), (12, 250)] {
            let info = StartupInfo::parse(&[ind, 0, 0x20, 0, 0, 0, 0]).unwrap();
            assert_eq!(info.payload_capacity(), cap, "indicator {ind}");
        }
    }

    #[test]
    fn short_blob_rejected() {
        assert!(StartupInfo::parse(&[0x00; 6]).is_err());
    }
}
