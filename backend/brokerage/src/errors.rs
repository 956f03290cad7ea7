//! Application-wide error types.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerageError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transaction {transaction_id} already recorded")]
    DuplicateTransaction { transaction_id: String },

    #[error("Marketplace is closed: {0}")]
    MarketClosed(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Caller-facing classification of a [`BrokerageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidState,
    DuplicateTransaction,
    MarketClosed,
    Unavailable,
    Unauthenticated,
    Forbidden,
}

impl BrokerageError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::DuplicateTransaction { .. } => ErrorKind::DuplicateTransaction,
            Self::MarketClosed(_) => ErrorKind::MarketClosed,
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Unavailable(_)
            | Self::Database(_)
            | Self::Migrate(_)
            | Self::Http(_)
            | Self::Json(_)
            | Self::Config(_) => ErrorKind::Unavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerageError>;
