//! Wallet ledger: every balance mutation runs inside one database transaction
//! that locks the wallet row (`SELECT ... FOR UPDATE`), updates the balance,
//! and appends to the transaction archive. The row lock serializes
//! concurrent credits/debits for the same user so neither reads a stale
//! balance; if the archive insert fails the whole transaction rolls back,
//! so a wallet's balance and its archive can never drift apart.

use chrono::{DateTime, Utc};
use cloudbill_errors::WalletError;
use cloudbill_models::{Transaction, TransactionType, Wallet};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

pub type WalletResult<T> = Result<T, WalletError>;

#[derive(Clone)]
pub struct WalletStore {
    pool: PgPool,
}

impl WalletStore {
    pub async fn new(database_url: &str) -> WalletResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(WalletError::Database)?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> WalletResult<Self> {
        Self::initialize_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn initialize_schema(pool: &PgPool) -> WalletResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT PRIMARY KEY,
                balance NUMERIC(20, 6) NOT NULL,
                currency TEXT NOT NULL,
                auto_recharge BOOLEAN NOT NULL DEFAULT FALSE,
                allow_negative BOOLEAN NOT NULL DEFAULT FALSE,
                last_deducted_at TIMESTAMPTZ,
                archival_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS wallet_transactions (
                tx_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES wallets(user_id),
                time TIMESTAMPTZ NOT NULL,
                amount NUMERIC(20, 6) NOT NULL,
                balance_after NUMERIC(20, 6) NOT NULL,
                type TEXT NOT NULL,
                reason TEXT NOT NULL,
                price_version TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_wallet_transactions_user_time
                ON wallet_transactions(user_id, time);
            "#,
        )
        .execute(pool)
        .await
        .map_err(WalletError::Database)?;

        Ok(())
    }

    pub async fn create(
        &self,
        user_id: &str,
        initial_balance: Decimal,
        currency: &str,
        auto_recharge: bool,
        allow_negative: bool,
        at: DateTime<Utc>,
    ) -> WalletResult<Wallet> {
        if self.get(user_id).await?.is_some() {
            return Err(WalletError::AlreadyExists {
                user_id: user_id.to_string(),
            });
        }

        let archival_id = format!("arch_{}", Uuid::new_v4().simple());
        let mut tx = self.pool.begin().await.map_err(WalletError::Database)?;

        sqlx::query(
            r#"INSERT INTO wallets (user_id, balance, currency, auto_recharge, allow_negative, last_deducted_at, archival_id)
               VALUES ($1, $2, $3, $4, $5, NULL, $6)"#,
        )
        .bind(user_id)
        .bind(initial_balance)
        .bind(currency)
        .bind(auto_recharge)
        .bind(allow_negative)
        .bind(&archival_id)
        .execute(&mut *tx)
        .await
        .map_err(WalletError::Database)?;

        if initial_balance > Decimal::ZERO {
            insert_transaction(
                &mut tx,
                user_id,
                at,
                initial_balance,
                initial_balance,
                TransactionType::Credit,
                "Initial balance",
                None,
            )
            .await?;
        }

        tx.commit().await.map_err(WalletError::Database)?;

        Ok(Wallet {
            user_id: user_id.to_string(),
            balance: initial_balance,
            currency: currency.to_string(),
            auto_recharge,
            allow_negative,
            last_deducted_at: None,
            archival_id,
        })
    }

    pub async fn get(&self, user_id: &str) -> WalletResult<Option<Wallet>> {
        let row = sqlx::query_as::<_, WalletRow>(
            r#"SELECT user_id, balance, currency, auto_recharge, allow_negative, last_deducted_at, archival_id
               FROM wallets WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(WalletError::Database)?;

        Ok(row.map(Into::into))
    }

    /// `amount` must be strictly positive; callers enforce this.
    ///
    /// Holds the wallet row locked for the lifetime of the transaction
    /// (`SELECT ... FOR UPDATE`) so a concurrent credit/debit for the same
    /// user can't read a stale balance and overwrite this one's update.
    pub async fn credit(
        &self,
        user_id: &str,
        amount: Decimal,
        reason: &str,
        at: DateTime<Utc>,
    ) -> WalletResult<Wallet> {
        let mut tx = self.pool.begin().await.map_err(WalletError::Database)?;
        let mut wallet = lock_wallet(&mut tx, user_id).await?.ok_or_else(|| WalletError::NotFound {
            user_id: user_id.to_string(),
        })?;

        wallet.balance += amount;

        update_balance(&mut tx, user_id, wallet.balance, wallet.last_deducted_at).await?;
        insert_transaction(
            &mut tx,
            user_id,
            at,
            amount,
            wallet.balance,
            TransactionType::Credit,
            reason,
            None,
        )
        .await?;
        tx.commit().await.map_err(WalletError::Database)?;

        Ok(wallet)
    }

    /// Returns `InsufficientBalance` without mutating state when
    /// `allow_negative` is false and the wallet can't cover `amount`. Holds
    /// the wallet row locked for the lifetime of the transaction, same as
    /// [`WalletStore::credit`].
    pub async fn debit(
        &self,
        user_id: &str,
        amount: Decimal,
        reason: &str,
        price_version: Option<&str>,
        at: DateTime<Utc>,
    ) -> WalletResult<Wallet> {
        let mut tx = self.pool.begin().await.map_err(WalletError::Database)?;
        let mut wallet = lock_wallet(&mut tx, user_id).await?.ok_or_else(|| WalletError::NotFound {
            user_id: user_id.to_string(),
        })?;

        if !wallet.allow_negative && wallet.balance < amount {
            return Err(WalletError::InsufficientBalance {
                user_id: user_id.to_string(),
            });
        }

        wallet.balance -= amount;
        wallet.last_deducted_at = Some(at);

        update_balance(&mut tx, user_id, wallet.balance, wallet.last_deducted_at).await?;
        insert_transaction(
            &mut tx,
            user_id,
            at,
            -amount,
            wallet.balance,
            TransactionType::Debit,
            reason,
            price_version,
        )
        .await?;
        tx.commit().await.map_err(WalletError::Database)?;

        Ok(wallet)
    }

    pub async fn history(&self, user_id: &str) -> WalletResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"SELECT tx_id, time, amount, balance_after, type, reason, price_version
               FROM wallet_transactions WHERE user_id = $1 ORDER BY time"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(WalletError::Database)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Reads a wallet row with `FOR UPDATE`, taking a row lock that's held
/// until the caller's transaction commits or rolls back.
async fn lock_wallet(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, user_id: &str) -> WalletResult<Option<Wallet>> {
    let row = sqlx::query_as::<_, WalletRow>(
        r#"SELECT user_id, balance, currency, auto_recharge, allow_negative, last_deducted_at, archival_id
           FROM wallets WHERE user_id = $1 FOR UPDATE"#,
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(WalletError::Database)?;

    Ok(row.map(Into::into))
}

async fn update_balance(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: &str,
    balance: Decimal,
    last_deducted_at: Option<DateTime<Utc>>,
) -> WalletResult<()> {
    sqlx::query("UPDATE wallets SET balance = $2, last_deducted_at = $3 WHERE user_id = $1")
        .bind(user_id)
        .bind(balance)
        .bind(last_deducted_at)
        .execute(&mut **tx)
        .await
        .map_err(WalletError::Database)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: &str,
    at: DateTime<Utc>,
    amount: Decimal,
    balance_after: Decimal,
    tx_type: TransactionType,
    reason: &str,
    price_version: Option<&str>,
) -> WalletResult<()> {
    let tx_id = format!("tx_{}", &Uuid::new_v4().simple().to_string()[..12]);

    sqlx::query(
        r#"INSERT INTO wallet_transactions (tx_id, user_id, time, amount, balance_after, type, reason, price_version)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
    )
    .bind(tx_id)
    .bind(user_id)
    .bind(at)
    .bind(amount)
    .bind(balance_after)
    .bind(tx_type.as_str())
    .bind(reason)
    .bind(price_version)
    .execute(&mut **tx)
    .await
    .map_err(WalletError::Database)?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct WalletRow {
    user_id: String,
    balance: Decimal,
    currency: String,
    auto_recharge: bool,
    allow_negative: bool,
    last_deducted_at: Option<DateTime<Utc>>,
    archival_id: String,
}

impl From<WalletRow> for Wallet {
    fn from(row: WalletRow) -> Self {
        Wallet {
            user_id: row.user_id,
            balance: row.balance,
            currency: row.currency,
            auto_recharge: row.auto_recharge,
            allow_negative: row.allow_negative,
            last_deducted_at: row.last_deducted_at,
            archival_id: row.archival_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    tx_id: String,
    time: DateTime<Utc>,
    amount: Decimal,
    balance_after: Decimal,
    #[sqlx(rename = "type")]
    tx_type: String,
    reason: String,
    price_version: Option<String>,
}

impl From<TransactionRow> for Transaction {
    fn from(row: TransactionRow) -> Self {
        Transaction {
            tx_id: row.tx_id,
            time: row.time,
            amount: row.amount,
            balance_after: row.balance_after,
            tx_type: if row.tx_type == "credit" {
                TransactionType::Credit
            } else {
                TransactionType::Debit
            },
            reason: row.reason,
            price_version: row.price_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_type_round_trips() {
        assert_eq!(TransactionType::Credit.as_str(), "credit");
        assert_eq!(TransactionType::Debit.as_str(), "debit");
    }
}
