//! Crate-wide error type.

use thiserror::Error;

use crate::hub::bus::{
    BusCallError, BusError, ERR_FORBIDDEN, ERR_INVALID_PARAMS, ERR_NOT_FOUND, ERR_UNAVAILABLE,
};
use crate::types::ConversationState;

#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("config error: {0}")]
    Config(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The hub could not be reached or dropped the reply.
    #[error("bus error: {0}")]
    Bus(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid transition from {state:?}: {message}")]
    InvalidTransition {
        state: ConversationState,
        message: String,
    },

    #[error("signature error: {0}")]
    Signature(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("quote rejected: {0}")]
    QuoteRejected(String),

    #[error("conversation closed: {0}")]
    ConversationClosed(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("transcript error: {0}")]
    Transcript(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<BusError> for MarketplaceError {
    fn from(e: BusError) -> Self {
        match e.code {
            ERR_NOT_FOUND => MarketplaceError::NotFound(e.message),
            ERR_FORBIDDEN => MarketplaceError::Forbidden(e.message),
            ERR_INVALID_PARAMS => MarketplaceError::InvalidParams(e.message),
            ERR_UNAVAILABLE => MarketplaceError::Unavailable(e.message),
            code => MarketplaceError::Bus(format!("{code}: {}", e.message)),
        }
    }
}

impl From<BusCallError> for MarketplaceError {
    fn from(e: BusCallError) -> Self {
        MarketplaceError::Bus(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::bus::ERR_METHOD_NOT_FOUND;
    use std::error::Error;

    #[test]
    fn config_error_display() {
        let e = MarketplaceError::Config("missing field".into());
        assert!(e.to_string().contains("config error"));
        assert!(e.to_string().contains("missing field"));
    }

    #[test]
    fn transition_error_names_state() {
        let e = MarketplaceError::InvalidTransition {
            state: ConversationState::Closed,
            message: "text after close".into(),
        };
        assert!(e.to_string().contains("Closed"));
        assert!(e.to_string().contains("text after close"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: MarketplaceError = io_err.into();
        assert!(e.to_string().contains("io error"));
        let _: &dyn Error = &e;
    }

    #[test]
    fn json_error_converts_to_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e: MarketplaceError = json_err.into();
        assert!(matches!(e, MarketplaceError::Serialization(_)));
        assert!(e.to_string().contains("serialization error"));
    }

    #[test]
    fn bus_codes_map_to_variants() {
        let e: MarketplaceError = BusError::new(ERR_NOT_FOUND, "svc").into();
        assert!(matches!(e, MarketplaceError::NotFound(m) if m == "svc"));

        let e: MarketplaceError = BusError::new(ERR_FORBIDDEN, "owner").into();
        assert!(matches!(e, MarketplaceError::Forbidden(_)));

        let e: MarketplaceError = BusError::new(ERR_UNAVAILABLE, "offline").into();
        assert!(matches!(e, MarketplaceError::Unavailable(_)));

        let e: MarketplaceError = BusError::new(ERR_METHOD_NOT_FOUND, "nope").into();
        assert!(matches!(e, MarketplaceError::Bus(m) if m.contains("nope")));

        let e: MarketplaceError = BusCallError::Send.into();
        assert!(matches!(e, MarketplaceError::Bus(m) if m.contains("not running")));
    }
}
