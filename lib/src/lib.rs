// Copyright (c) 2023-2024 The calypso-tx Authors

//! Calypso card transaction engine
//!
//! Turns prepared high-level operations into correctly ordered,
//! correctly batched binary exchanges against a card and, in parallel, a
//! crypto module, while maintaining an in-memory image of the card's
//! file system and enforcing the secure session protocol end to end.
//!
//! The flow: resolve a [`CardProfile`] from the card's startup
//! information, build a [`CardTransactionManager`] over a
//! [`CardTransport`] (and a [`CryptoModule`][crypto::CryptoModule] for
//! secure sessions), queue operations with
//! [`prepare`][CardTransactionManager::prepare], then drive them with
//! the `process_*` methods. Responses are folded into the
//! [`CardImage`], which the caller reads back.
//!
//! All exchanges are synchronous and blocking; a manager instance must
//! stay on a single thread.

/// Re-export `calypso-apdu` for consumers
pub use calypso_apdu as apdu;

mod error;
pub use error::{Error, StateError};

pub mod crypto;
pub use crypto::{CryptoModule, NoCrypto};

mod transport;
pub use transport::CardTransport;

mod profile;
pub use profile::{CardFeatures, CardProfile, ProductType, StartupInfo};

mod image;
pub use image::{CardImage, ElementaryFile, SessionContext, StoredValueState};

mod settings;
pub use settings::SecuritySettings;

mod batch;
pub use batch::CardOperation;

mod manager;
pub use manager::{CardTransactionManager, SessionStatus};
