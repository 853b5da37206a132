// Copyright (c) 2023-2024 The calypso-tx Authors

use calypso_apdu::{ApduError, Instruction, ParamError, StatusWord};

/// Boxed collaborator error carried as an error source
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Calypso transaction engine error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Out-of-range command parameter, rejected before any exchange
    #[error(transparent)]
    Parameter(#[from] ParamError),

    /// Operation invoked in the wrong engine state
    #[error(transparent)]
    State(#[from] StateError),

    /// Status word outside the command's acceptance set
    #[error("card answered {command} with status {sw}")]
    UnexpectedStatus {
        command: Instruction,
        sw: StatusWord,
    },

    /// Response payload the command decoder could not make sense of
    #[error("malformed {command} response: {source}")]
    ResponseParse {
        command: Instruction,
        source: ApduError,
    },

    /// Live open-session data-out disagrees with the pre-computed value
    #[error("open-session response differs from the anticipated data-out")]
    AnticipatedMismatch,

    /// Session key pair outside the configured policy
    #[error("session key (KIF {kif:#04x}, KVC {kvc:#04x}) is not authorized")]
    UnauthorizedKey { kif: u8, kvc: u8 },

    /// Card session signature rejected by the crypto module
    #[error("card session MAC rejected by the crypto module")]
    InvalidCardMac,

    /// Stored value operation refused by the crypto module
    #[error("stored value operation refused by the crypto module")]
    SvRefused,

    /// Transport failure talking to the card
    #[error("card transport failed: {0}")]
    CardComm(#[source] BoxedSource),

    /// Transport failure talking to the crypto module
    #[error("crypto module failed: {0}")]
    CryptoComm(#[source] BoxedSource),

    /// Transport returned the wrong number of responses
    #[error("transport returned {received} responses to {sent} requests")]
    ResponseCount { sent: usize, received: usize },
}

impl Error {
    /// Attach command context to a decode failure
    pub(crate) fn decode(command: Instruction, e: ApduError) -> Self {
        match e {
            ApduError::Status(sw) => Error::UnexpectedStatus { command, sw },
            ApduError::Param(p) => Error::Parameter(p),
            source => Error::ResponseParse { command, source },
        }
    }
}

/// Operation invoked against the wrong engine or card state
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum StateError {
    /// Session-bound operation with no open session
    #[error("no secure session is open")]
    NoSession,

    /// Session opening attempted while another session is open
    #[error("a secure session is already open")]
    SessionAlreadyOpen,

    /// Operation forbidden while a session is open
    #[error("operation not allowed while a secure session is open")]
    NotAllowedInSession,

    /// Set-counter against a counter never read in this image
    #[error("counter {counter} of file {sfi:#04x} has not been read")]
    CounterNotRead { sfi: u8, counter: u8 },

    /// Stored value operation with no SV Get in the same processing unit
    #[error("stored value operation requires an SV Get in the same processing unit")]
    SvGetMissing,

    /// More than one stored value operation queued for one processing unit
    #[error("only one stored value operation is allowed per processing unit")]
    SvOperationAlreadyPrepared,

    /// PIN verification queued behind other commands before an opening
    #[error("PIN verification must be the first prepared command")]
    PinNotFirst,

    /// Invalidate on an already invalidated card
    #[error("card is already invalidated")]
    AlreadyInvalidated,

    /// Rehabilitate on a card that is not invalidated
    #[error("card is not invalidated")]
    NotInvalidated,

    /// Operation outside the card profile's feature set
    #[error("{0} is not supported by this product")]
    UnsupportedFeature(&'static str),

    /// Crypto-bound operation with no crypto module configured
    #[error("no crypto module is configured")]
    NoCryptoModule,

    /// Plaintext PIN transmission without the opt-in
    #[error("plaintext PIN transmission is not enabled")]
    PlainPinDisabled,
}
