//! Postgres-backed ledger store.
//!
//! Conditional debits are a single `UPDATE ... WHERE balance >= $amount`
//! statement, so the row lock taken by Postgres covers both the check and the
//! write. The lock is held until the surrounding transaction ends.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | WalletError |
//! |------------|---------------|-------------|
//! | Database (unique violation) on `wallets` | `23505` | `WalletsAlreadyProvisioned` |
//! | Database (numeric value out of range) | `22003` | `Validation` |
//! | Database (other) | any | `StoreUnavailable` |
//! | PoolTimedOut / PoolClosed / Io | n/a | `StoreUnavailable` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;
use wallet_common::{
    AccountId, Balances, Currency, Direction, EventId, OperationKind, RecordId, Result,
    WalletError, WalletId,
};

use crate::balance::{AdjustOutcome, WalletSnapshot};
use crate::journal::TransactionRecord;
use crate::outbox::OutboxEvent;
use crate::store::{LedgerStore, LedgerTransaction};

/// Ledger store on a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Connect a new pool.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        info!(max_connections, "Connected to ledger database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| WalletError::StoreUnavailable(format!("migration failed: {e}")))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PgLedgerTransaction { tx }))
    }

    async fn read_balances(&self, account: AccountId) -> Result<Balances> {
        let rows = sqlx::query("SELECT currency, balance FROM wallets WHERE account_id = $1")
            .bind(account.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_balances", e))?;
        balances_from_rows(&rows)
    }

    async fn transaction_records(&self, account: AccountId) -> Result<Vec<TransactionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.wallet_id, w.currency, t.amount, t.direction, t.kind,
                   t.counterparty_wallet_id, t.created_at
            FROM wallet_transactions t
            JOIN wallets w ON w.id = t.wallet_id
            WHERE w.account_id = $1
            ORDER BY t.created_at ASC, t.id ASC
            "#,
        )
        .bind(account.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transaction_records", e))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, account_id, payload, created_at
            FROM ledger_events
            WHERE published_at IS NULL
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_events", e))?;

        rows.iter().map(event_from_row).collect()
    }

    async fn mark_published(&self, ids: &[EventId]) -> Result<()> {
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        sqlx::query("UPDATE ledger_events SET published_at = now() WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_published", e))?;
        Ok(())
    }
}

/// An open Postgres transaction.
pub struct PgLedgerTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgLedgerTransaction {
    async fn snapshot(
        &mut self,
        account: AccountId,
        currency: Currency,
        wallet_id: Uuid,
    ) -> Result<WalletSnapshot> {
        let rows = sqlx::query("SELECT currency, balance FROM wallets WHERE account_id = $1")
            .bind(account.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("snapshot", e))?;

        Ok(WalletSnapshot {
            account_id: account,
            wallet_id: WalletId::from_uuid(wallet_id),
            currency,
            balances: balances_from_rows(&rows)?,
        })
    }
}

#[async_trait]
impl LedgerTransaction for PgLedgerTransaction {
    #[instrument(skip_all, fields(account = %account, currency = %currency, direction = direction.as_str()))]
    async fn adjust_balance(
        &mut self,
        account: AccountId,
        currency: Currency,
        amount: Decimal,
        direction: Direction,
    ) -> Result<AdjustOutcome> {
        let statement = match direction {
            Direction::Credit => {
                r#"
                UPDATE wallets SET balance = balance + $1, updated_at = now()
                WHERE account_id = $2 AND currency = $3
                RETURNING id
                "#
            }
            Direction::Debit => {
                r#"
                UPDATE wallets SET balance = balance - $1, updated_at = now()
                WHERE account_id = $2 AND currency = $3 AND balance >= $1
                RETURNING id
                "#
            }
        };

        let updated = sqlx::query(statement)
            .bind(amount)
            .bind(account.as_uuid())
            .bind(currency.code())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("adjust_balance", e))?;

        match updated {
            Some(row) => {
                let wallet_id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("adjust_balance", e))?;
                let snapshot = self.snapshot(account, currency, wallet_id).await?;
                Ok(AdjustOutcome::Applied(snapshot))
            }
            None => {
                let exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM wallets WHERE account_id = $1 AND currency = $2)",
                )
                .bind(account.as_uuid())
                .bind(currency.code())
                .fetch_one(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("adjust_balance", e))?;

                if exists {
                    debug!(amount = %amount, "Debit condition failed");
                    Ok(AdjustOutcome::InsufficientFunds)
                } else {
                    Err(WalletError::WalletNotFound { account, currency })
                }
            }
        }
    }

    async fn append_transaction_record(&mut self, record: &TransactionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_transactions
                (id, wallet_id, amount, direction, kind, counterparty_wallet_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.wallet_id.as_uuid())
        .bind(record.amount)
        .bind(record.direction.as_str())
        .bind(record.kind.as_str())
        .bind(record.counterparty_wallet_id.map(|id| *id.as_uuid()))
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_transaction_record", e))?;
        Ok(())
    }

    async fn provision_wallets(&mut self, account: AccountId) -> Result<()> {
        for currency in Currency::ALL {
            sqlx::query(
                r#"
                INSERT INTO wallets (id, account_id, currency, balance)
                VALUES ($1, $2, $3, 0)
                "#,
            )
            .bind(WalletId::new().as_uuid())
            .bind(account.as_uuid())
            .bind(currency.code())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    WalletError::WalletsAlreadyProvisioned(account)
                }
                other => map_sqlx_error("provision_wallets", other),
            })?;
        }
        Ok(())
    }

    async fn enqueue_event(&mut self, event: &OutboxEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_events (id, kind, account_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.kind.as_str())
        .bind(event.account_id.as_uuid())
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| WalletError::NotificationEnqueueFailed(e.to_string()))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// SQLSTATE raised when a balance leaves the `NUMERIC(20, 2)` range.
const NUMERIC_OUT_OF_RANGE: &str = "22003";

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> WalletError {
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(NUMERIC_OUT_OF_RANGE) => {
            WalletError::validation(format!("amount out of range in {operation}: {}", db.message()))
        }
        sqlx::Error::Database(db) => {
            WalletError::StoreUnavailable(format!("database error in {operation}: {}", db.message()))
        }
        sqlx::Error::PoolTimedOut => {
            WalletError::StoreUnavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            WalletError::StoreUnavailable(format!("connection pool closed in {operation}"))
        }
        other => WalletError::StoreUnavailable(format!("sqlx error in {operation}: {other}")),
    }
}

fn decode<T>(operation: &str, value: std::result::Result<T, sqlx::Error>) -> Result<T> {
    value.map_err(|e| map_sqlx_error(operation, e))
}

fn balances_from_rows(rows: &[PgRow]) -> Result<Balances> {
    let mut balances = Balances::new();
    for row in rows {
        let code: String = decode("balances", row.try_get("currency"))?;
        let balance: Decimal = decode("balances", row.try_get("balance"))?;
        balances.insert(code.parse()?, balance);
    }
    Ok(balances)
}

fn record_from_row(row: &PgRow) -> Result<TransactionRecord> {
    let op = "transaction_records";
    let currency: String = decode(op, row.try_get("currency"))?;
    let direction: String = decode(op, row.try_get("direction"))?;
    let kind: String = decode(op, row.try_get("kind"))?;
    let counterparty: Option<Uuid> = decode(op, row.try_get("counterparty_wallet_id"))?;
    let created_at: DateTime<Utc> = decode(op, row.try_get("created_at"))?;

    Ok(TransactionRecord {
        id: RecordId::from_uuid(decode(op, row.try_get("id"))?),
        wallet_id: WalletId::from_uuid(decode(op, row.try_get("wallet_id"))?),
        currency: currency.parse()?,
        amount: decode(op, row.try_get("amount"))?,
        direction: direction.parse()?,
        kind: kind.parse::<OperationKind>()?,
        counterparty_wallet_id: counterparty.map(WalletId::from_uuid),
        created_at,
    })
}

fn event_from_row(row: &PgRow) -> Result<OutboxEvent> {
    let op = "pending_events";
    let kind: String = decode(op, row.try_get("kind"))?;

    Ok(OutboxEvent {
        id: EventId::from_uuid(decode(op, row.try_get("id"))?),
        kind: kind.parse()?,
        account_id: AccountId::from_uuid(decode(op, row.try_get("account_id"))?),
        payload: decode(op, row.try_get("payload"))?,
        created_at: decode(op, row.try_get("created_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // Requires a reachable database: DATABASE_URL=postgres://... cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_conditional_debit_against_postgres() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgLedgerStore::connect(&url, 5, Duration::from_secs(5))
            .await
            .unwrap();
        store.migrate().await.unwrap();

        let account = AccountId::new();
        let mut tx = store.begin().await.unwrap();
        tx.provision_wallets(account).await.unwrap();
        let outcome = tx
            .adjust_balance(account, Currency::Usd, dec!(10), Direction::Credit)
            .await
            .unwrap();
        assert!(outcome.is_applied());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let outcome = tx
            .adjust_balance(account, Currency::Usd, dec!(20), Direction::Debit)
            .await
            .unwrap();
        assert_eq!(outcome, AdjustOutcome::InsufficientFunds);
        tx.rollback().await.unwrap();

        let balances = store.read_balances(account).await.unwrap();
        assert_eq!(balances.get(Currency::Usd), Some(dec!(10)));

        let mut tx = store.begin().await.unwrap();
        let err = tx.provision_wallets(account).await.unwrap_err();
        assert_eq!(err.error_code(), "WALLETS_ALREADY_PROVISIONED");
    }
}
