//! Error types for the cloudbill billing engine.

use thiserror::Error;

/// Top-level error aggregating every subsystem's error type.
#[derive(Error, Debug)]
pub enum CloudbillError {
    #[error("resource store error: {0}")]
    Store(#[from] StoreError),

    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("pricing error: {0}")]
    Pricing(#[from] PricingError),

    #[error("billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    #[error("api client error: {0}")]
    ApiClient(#[from] ApiClientError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Resource store errors (§4.2).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("resource not found: {resource_id}")]
    NotFound { resource_id: String },

    #[error("resource already exists: {resource_id}")]
    Conflict { resource_id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Wallet ledger errors (§4.3).
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("wallet not found for user: {user_id}")]
    NotFound { user_id: String },

    #[error("wallet already exists for user: {user_id}")]
    AlreadyExists { user_id: String },

    #[error("insufficient balance for user: {user_id}")]
    InsufficientBalance { user_id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Price catalog errors.
#[derive(Error, Debug)]
pub enum PricingError {
    #[error("no pricing found for currency: {currency}")]
    NotFound { currency: String },

    #[error("currency {currency} does not exist; use create with all required fields")]
    IncompleteCreate { currency: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Billing engine errors (§4.4).
#[derive(Error, Debug)]
pub enum BillingError {
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("pricing error: {0}")]
    Pricing(#[from] PricingError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bill not found: {bill_id}")]
    BillNotFound { bill_id: String },

    #[error("bill already paid: {bill_id}")]
    AlreadyPaid { bill_id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Queue consumer errors (§4.5).
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("unparseable message: {reason}")]
    Unparseable { reason: String },

    #[error("message could not be classified into a known resource/event type")]
    Unclassified,

    #[error("broker connection error: {0}")]
    Broker(String),

    #[error("api client error: {0}")]
    ApiClient(#[from] ApiClientError),
}

/// API client errors (§4.6).
#[derive(Error, Debug)]
pub enum ApiClientError {
    #[error("request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("connection error after {attempts} attempt(s): {message}")]
    Connection { attempts: u32, message: String },

    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}
