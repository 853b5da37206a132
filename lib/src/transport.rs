// Copyright (c) 2023-2024 The calypso-tx Authors

//! Reader transport boundary
//!
//! The engine hands the transport ordered groups of request APDUs and
//! expects one response per request, in order. Calls are synchronous and
//! blocking; timeouts and retries belong to the implementation behind
//! this trait.

use calypso_apdu::{ApduRequest, ApduResponse};

/// Synchronous card reader transport
pub trait CardTransport {
    /// Implementation-specific communication error
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a group of request APDUs, returning one response per request
    fn transmit(&mut self, requests: &[ApduRequest]) -> Result<Vec<ApduResponse>, Self::Error>;
}

impl<T: CardTransport> CardTransport for &mut T {
    type Error = T::Error;

    fn transmit(&mut self, requests: &[ApduRequest]) -> Result<Vec<ApduResponse>, Self::Error> {
        T::transmit(self, requests)
    }
}
