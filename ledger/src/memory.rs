//! In-memory ledger store.
//!
//! Mirrors the row-level semantics of the Postgres store: a mutated wallet
//! row stays locked by its transaction until commit or rollback, other
//! transactions read committed values only, and writes become visible
//! together at commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, instrument, warn};
use wallet_common::{
    AccountId, Balances, Currency, Direction, EventId, Money, Result, WalletError, WalletId,
};

use crate::balance::{AdjustOutcome, WalletSnapshot};
use crate::journal::TransactionRecord;
use crate::outbox::OutboxEvent;
use crate::store::{LedgerStore, LedgerTransaction};

type WalletKey = (AccountId, Currency);

/// Point at which an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    AppendRecord,
    EnqueueEvent,
    Commit,
    Rollback,
}

/// Configuration for the in-memory store.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// How long a transaction waits for a row lock before failing.
    pub lock_timeout: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
struct WalletRow {
    id: WalletId,
    balance: Decimal,
}

#[derive(Debug, Clone)]
struct StoredEvent {
    event: OutboxEvent,
    published: bool,
}

#[derive(Debug, Default)]
struct CommittedState {
    wallets: HashMap<AccountId, BTreeMap<Currency, WalletRow>>,
    records: Vec<TransactionRecord>,
    events: Vec<StoredEvent>,
}

impl CommittedState {
    fn wallet(&self, key: &WalletKey) -> Option<&WalletRow> {
        self.wallets.get(&key.0).and_then(|rows| rows.get(&key.1))
    }
}

struct Shared {
    state: RwLock<CommittedState>,
    row_locks: DashMap<WalletKey, Arc<tokio::sync::Mutex<()>>>,
    faults: Mutex<Vec<FaultPoint>>,
    config: MemoryStoreConfig,
}

impl Shared {
    fn take_fault(&self, point: FaultPoint) -> bool {
        let mut faults = self.faults.lock();
        match faults.iter().position(|p| *p == point) {
            Some(idx) => {
                faults.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// Ledger store kept entirely in process memory.
#[derive(Clone)]
pub struct MemoryLedgerStore {
    shared: Arc<Shared>,
}

impl MemoryLedgerStore {
    /// Create a new store with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a new store with custom configuration.
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(CommittedState::default()),
                row_locks: DashMap::new(),
                faults: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    /// Make the next operation at `point` fail with `StoreUnavailable`.
    pub fn inject_fault(&self, point: FaultPoint) {
        self.shared.faults.lock().push(point);
    }

    /// Number of outbox events, delivered or not.
    pub fn event_count(&self) -> usize {
        self.shared.state.read().events.len()
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>> {
        if self.shared.take_fault(FaultPoint::Begin) {
            return Err(WalletError::StoreUnavailable("injected begin failure".into()));
        }
        Ok(Box::new(MemoryTransaction::new(self.shared.clone())))
    }

    async fn read_balances(&self, account: AccountId) -> Result<Balances> {
        let state = self.shared.state.read();
        Ok(state
            .wallets
            .get(&account)
            .map(|rows| rows.iter().map(|(c, row)| (*c, row.balance)).collect())
            .unwrap_or_default())
    }

    async fn transaction_records(&self, account: AccountId) -> Result<Vec<TransactionRecord>> {
        let state = self.shared.state.read();
        let Some(rows) = state.wallets.get(&account) else {
            return Ok(Vec::new());
        };
        let wallet_ids: Vec<WalletId> = rows.values().map(|row| row.id).collect();

        Ok(state
            .records
            .iter()
            .filter(|r| wallet_ids.contains(&r.wallet_id))
            .cloned()
            .collect())
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let state = self.shared.state.read();
        Ok(state
            .events
            .iter()
            .filter(|e| !e.published)
            .take(limit)
            .map(|e| e.event.clone())
            .collect())
    }

    async fn mark_published(&self, ids: &[EventId]) -> Result<()> {
        let mut state = self.shared.state.write();
        for stored in state.events.iter_mut() {
            if ids.contains(&stored.event.id) {
                stored.published = true;
            }
        }
        Ok(())
    }
}

/// Transaction over a [`MemoryLedgerStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    guards: HashMap<WalletKey, OwnedMutexGuard<()>>,
    deltas: HashMap<WalletKey, Decimal>,
    provisioned: HashMap<WalletKey, WalletId>,
    records: Vec<TransactionRecord>,
    events: Vec<OutboxEvent>,
}

impl MemoryTransaction {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            guards: HashMap::new(),
            deltas: HashMap::new(),
            provisioned: HashMap::new(),
            records: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Lock a row for the rest of this transaction.
    async fn lock_row(&mut self, key: WalletKey) -> Result<()> {
        if self.guards.contains_key(&key) {
            return Ok(());
        }

        let lock = self.shared.row_locks.entry(key).or_default().clone();
        let guard = tokio::time::timeout(self.shared.config.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                warn!(account = %key.0, currency = %key.1, "Row lock wait timed out");
                WalletError::StoreUnavailable(format!(
                    "lock wait timeout on wallet {}/{}",
                    key.0, key.1
                ))
            })?;

        self.guards.insert(key, guard);
        Ok(())
    }

    fn wallet_id(&self, key: &WalletKey) -> Option<WalletId> {
        self.provisioned
            .get(key)
            .copied()
            .or_else(|| self.shared.state.read().wallet(key).map(|row| row.id))
    }

    /// Balances of an account as seen from inside this transaction.
    fn visible_balances(&self, account: AccountId) -> Balances {
        let state = self.shared.state.read();
        let mut balances: Balances = state
            .wallets
            .get(&account)
            .map(|rows| rows.iter().map(|(c, row)| (*c, row.balance)).collect())
            .unwrap_or_default();

        for (owner, currency) in self.provisioned.keys() {
            if *owner == account && balances.get(*currency).is_none() {
                balances.insert(*currency, Decimal::ZERO);
            }
        }
        for ((owner, currency), delta) in &self.deltas {
            if *owner == account {
                let base = balances.get(*currency).unwrap_or(Decimal::ZERO);
                balances.insert(*currency, base + *delta);
            }
        }
        balances
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    #[instrument(skip_all, fields(account = %account, currency = %currency, direction = direction.as_str()))]
    async fn adjust_balance(
        &mut self,
        account: AccountId,
        currency: Currency,
        amount: Decimal,
        direction: Direction,
    ) -> Result<AdjustOutcome> {
        let key = (account, currency);
        let wallet_id = self
            .wallet_id(&key)
            .ok_or(WalletError::WalletNotFound { account, currency })?;

        self.lock_row(key).await?;

        let current = self.visible_balances(account).get(currency).unwrap_or(Decimal::ZERO);
        if direction == Direction::Debit && current < amount {
            debug!(balance = %current, amount = %amount, "Debit condition failed");
            return Ok(AdjustOutcome::InsufficientFunds);
        }

        let delta = direction.signed(amount);
        match current.checked_add(delta) {
            Some(next) if next <= Money::MAX_VALUE => {}
            _ => {
                return Err(WalletError::validation(format!(
                    "{currency} balance {current} cannot take a {} of {amount}",
                    direction.as_str()
                )))
            }
        }
        *self.deltas.entry(key).or_insert(Decimal::ZERO) += delta;

        Ok(AdjustOutcome::Applied(WalletSnapshot {
            account_id: account,
            wallet_id,
            currency,
            balances: self.visible_balances(account),
        }))
    }

    async fn append_transaction_record(&mut self, record: &TransactionRecord) -> Result<()> {
        if self.shared.take_fault(FaultPoint::AppendRecord) {
            return Err(WalletError::StoreUnavailable("injected audit insert failure".into()));
        }
        self.records.push(record.clone());
        Ok(())
    }

    async fn provision_wallets(&mut self, account: AccountId) -> Result<()> {
        for currency in Currency::ALL {
            let key = (account, currency);
            self.lock_row(key).await?;
            if self.wallet_id(&key).is_some() {
                return Err(WalletError::WalletsAlreadyProvisioned(account));
            }
            self.provisioned.insert(key, WalletId::new());
        }
        Ok(())
    }

    async fn enqueue_event(&mut self, event: &OutboxEvent) -> Result<()> {
        if self.shared.take_fault(FaultPoint::EnqueueEvent) {
            return Err(WalletError::NotificationEnqueueFailed(
                "injected outbox insert failure".into(),
            ));
        }
        self.events.push(event.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.shared.take_fault(FaultPoint::Commit) {
            return Err(WalletError::StoreUnavailable("injected commit failure".into()));
        }

        let MemoryTransaction {
            shared,
            guards,
            deltas,
            provisioned,
            records,
            events,
        } = *self;

        {
            let mut state = shared.state.write();
            for ((account, currency), id) in provisioned {
                state.wallets.entry(account).or_default().insert(
                    currency,
                    WalletRow {
                        id,
                        balance: Decimal::ZERO,
                    },
                );
            }
            for ((account, currency), delta) in deltas {
                if let Some(row) = state
                    .wallets
                    .get_mut(&account)
                    .and_then(|rows| rows.get_mut(&currency))
                {
                    row.balance += delta;
                    debug_assert!(row.balance >= Decimal::ZERO);
                }
            }
            state.records.extend(records);
            state
                .events
                .extend(events.into_iter().map(|event| StoredEvent {
                    event,
                    published: false,
                }));
        }

        drop(guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        if self.shared.take_fault(FaultPoint::Rollback) {
            return Err(WalletError::StoreUnavailable("injected rollback failure".into()));
        }
        Ok(())
    }
}
