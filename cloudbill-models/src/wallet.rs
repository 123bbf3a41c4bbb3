use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A user's balance plus the ledger settings governing how it may be spent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: String,
    pub balance: Decimal,
    pub currency: String,
    pub auto_recharge: bool,
    pub allow_negative: bool,
    pub last_deducted_at: Option<DateTime<Utc>>,
    pub archival_id: String,
}

/// Transaction kind, mirrored onto the `transaction_archives` document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Credit,
    Debit,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Credit => "credit",
            TransactionType::Debit => "debit",
        }
    }
}

/// One entry in a wallet's append-only transaction archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub time: DateTime<Utc>,
    pub amount: Decimal,
    pub balance_after: Decimal,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub reason: String,
    pub price_version: Option<String>,
}
