//! Ledger engine.
//!
//! Owns transaction boundaries for every balance mutation. Each mutating
//! call runs in exactly one store transaction and walks the stages of
//! [`OperationStage`]; any failure inside the transaction rolls it back and
//! surfaces the original error.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};
use wallet_common::{
    AccountId, Balances, Currency, CurrencyPair, Direction, Money, OperationKind,
    OperationProgress, OperationStage, Result, WalletError,
};
use wallet_fx::{PairQuote, RateSnapshot, SharedRateCache};
use wallet_ledger::{
    net_balances, AdjustOutcome, LedgerStore, LedgerTransaction, NotificationEvent, OutboxEvent,
    TransactionRecord, WalletSnapshot,
};

use crate::config::LedgerConfig;
use crate::context::RequestContext;
use crate::receipt::{ExchangeReceipt, IntegrityReport};

/// Entry point for wallet operations.
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    rates: SharedRateCache,
    config: LedgerConfig,
}

impl LedgerEngine {
    /// Create a new engine.
    pub fn new(store: Arc<dyn LedgerStore>, rates: SharedRateCache, config: LedgerConfig) -> Self {
        Self {
            store,
            rates,
            config,
        }
    }

    /// Provision one zero-balance wallet per supported currency.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn open_account(&self, ctx: &RequestContext, account: AccountId) -> Result<Balances> {
        ctx.run(self.provision(account)).await
    }

    /// Credit `amount` to the account's `currency` wallet.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn deposit(
        &self,
        ctx: &RequestContext,
        account: AccountId,
        currency: Currency,
        amount: Decimal,
    ) -> Result<WalletSnapshot> {
        let money = Money::positive(amount, currency)?;
        ctx.run(self.adjust(OperationKind::Deposit, account, money))
            .await
    }

    /// Debit `amount` from the account's `currency` wallet if the balance covers it.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn withdraw(
        &self,
        ctx: &RequestContext,
        account: AccountId,
        currency: Currency,
        amount: Decimal,
    ) -> Result<WalletSnapshot> {
        let money = Money::positive(amount, currency)?;
        ctx.run(self.adjust(OperationKind::Withdraw, account, money))
            .await
    }

    /// Convert `amount` of `from` into `to` at the current pair rate.
    ///
    /// The target leg is credited before the source leg is debited, so an
    /// insufficient source balance rolls the credit back with the transaction.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn exchange(
        &self,
        ctx: &RequestContext,
        account: AccountId,
        from: Currency,
        to: Currency,
        amount: Decimal,
    ) -> Result<ExchangeReceipt> {
        if from == to {
            return Err(WalletError::validation(format!(
                "cannot exchange {from} into itself"
            )));
        }
        let source = Money::positive(amount, from)?;
        ctx.run(self.convert(account, source, to)).await
    }

    /// Read committed balances.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn get_balance(&self, ctx: &RequestContext, account: AccountId) -> Result<Balances> {
        ctx.run(self.store.read_balances(account)).await
    }

    /// Read all exchange rates through the rate cache.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn get_all_currency_rates(&self, ctx: &RequestContext) -> Result<RateSnapshot> {
        ctx.run(self.all_rates()).await
    }

    /// Read a single pair rate through the rate cache.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn get_pair_rate(
        &self,
        ctx: &RequestContext,
        from: Currency,
        to: Currency,
    ) -> Result<PairQuote> {
        if from == to {
            return Err(WalletError::validation(format!("no rate for {from} into itself")));
        }
        ctx.run(self.pair_rate(CurrencyPair::new(from, to))).await
    }

    /// Read the committed audit log of an account, oldest first.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn transaction_history(
        &self,
        ctx: &RequestContext,
        account: AccountId,
    ) -> Result<Vec<TransactionRecord>> {
        ctx.run(self.store.transaction_records(account)).await
    }

    /// Reconcile committed balances with the audit log.
    ///
    /// Both are read outside a transaction, so the result is only meaningful
    /// for an account with no mutation in flight.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn verify_integrity(
        &self,
        ctx: &RequestContext,
        account: AccountId,
    ) -> Result<IntegrityReport> {
        ctx.run(self.reconcile(account)).await
    }

    async fn provision(&self, account: AccountId) -> Result<Balances> {
        let mut tx = self.store.begin().await?;

        let provisioned = tx.provision_wallets(account).await;
        if let Err(err) = provisioned {
            return Err(rollback(tx, err).await);
        }
        tx.commit().await?;

        info!(account = %account, "Wallets provisioned");
        self.store.read_balances(account).await
    }

    async fn adjust(
        &self,
        kind: OperationKind,
        account: AccountId,
        money: Money,
    ) -> Result<WalletSnapshot> {
        let mut progress = OperationProgress::new(kind);
        let mut tx = self.begin(&mut progress).await?;

        let result = self
            .apply_adjustment(tx.as_mut(), &mut progress, account, money)
            .await;
        let snapshot = finish(tx, &mut progress, result).await?;

        info!(
            account = %account,
            kind = kind.as_str(),
            amount = %money,
            balance = %snapshot.balance(),
            "Balance updated"
        );
        Ok(snapshot)
    }

    async fn apply_adjustment(
        &self,
        tx: &mut dyn LedgerTransaction,
        progress: &mut OperationProgress,
        account: AccountId,
        money: Money,
    ) -> Result<WalletSnapshot> {
        let kind = progress.kind;
        let direction = match kind {
            OperationKind::Withdraw => Direction::Debit,
            _ => Direction::Credit,
        };

        advance(progress, OperationStage::Mutate);
        let outcome = tx
            .adjust_balance(account, money.currency, money.value, direction)
            .await?;
        let snapshot = applied(outcome, &money)?;

        advance(progress, OperationStage::Audit);
        let record =
            TransactionRecord::new(snapshot.wallet_id, money.currency, money.value, direction, kind);
        tx.append_transaction_record(&record).await?;

        if money.value >= self.config.deposit_notify_threshold {
            advance(progress, OperationStage::Notify);
            let event = NotificationEvent::new(
                kind,
                account,
                money.value,
                money.currency,
                snapshot.balances.clone(),
            );
            tx.enqueue_event(&OutboxEvent::from_notification(&event)?)
                .await?;
        }

        Ok(snapshot)
    }

    async fn convert(
        &self,
        account: AccountId,
        source: Money,
        to: Currency,
    ) -> Result<ExchangeReceipt> {
        // Priced before the transaction opens; a rate failure touches nothing.
        let quote = self
            .rates
            .get_pair_rate(CurrencyPair::new(source.currency, to))
            .await?;
        let target = quote.convert(&source)?;
        if !target.is_positive() {
            return Err(WalletError::validation(format!(
                "{source} converts to zero {to} at rate {}",
                quote.rate
            )));
        }

        let mut progress = OperationProgress::new(OperationKind::Transfer);
        let mut tx = self.begin(&mut progress).await?;

        let result = self
            .apply_exchange(tx.as_mut(), &mut progress, account, source, target)
            .await;
        let snapshot = finish(tx, &mut progress, result).await?;

        let receipt = ExchangeReceipt::new(snapshot, quote.rate, source, target);
        info!(account = %account, rate = %quote.rate, "{}", receipt.message);
        Ok(receipt)
    }

    async fn apply_exchange(
        &self,
        tx: &mut dyn LedgerTransaction,
        progress: &mut OperationProgress,
        account: AccountId,
        source: Money,
        target: Money,
    ) -> Result<WalletSnapshot> {
        advance(progress, OperationStage::Mutate);
        let outcome = tx
            .adjust_balance(account, target.currency, target.value, Direction::Credit)
            .await?;
        let credited = applied(outcome, &target)?;

        advance(progress, OperationStage::Mutate);
        let outcome = tx
            .adjust_balance(account, source.currency, source.value, Direction::Debit)
            .await?;
        let debited = applied(outcome, &source)?;

        advance(progress, OperationStage::Audit);
        let credit_record = TransactionRecord::new(
            credited.wallet_id,
            target.currency,
            target.value,
            Direction::Credit,
            OperationKind::Transfer,
        )
        .with_counterparty(debited.wallet_id);
        let debit_record = TransactionRecord::new(
            debited.wallet_id,
            source.currency,
            source.value,
            Direction::Debit,
            OperationKind::Transfer,
        )
        .with_counterparty(credited.wallet_id);
        tx.append_transaction_record(&credit_record).await?;
        tx.append_transaction_record(&debit_record).await?;

        if target.value >= self.config.exchange_notify_threshold {
            advance(progress, OperationStage::Notify);
            // Reported as a withdrawal of the target amount, with the
            // balances seen right after the credit leg.
            let event = NotificationEvent::new(
                OperationKind::Withdraw,
                account,
                target.value,
                target.currency,
                credited.balances,
            );
            tx.enqueue_event(&OutboxEvent::from_notification(&event)?)
                .await?;
        }

        Ok(WalletSnapshot {
            wallet_id: credited.wallet_id,
            currency: credited.currency,
            ..debited
        })
    }

    async fn all_rates(&self) -> Result<RateSnapshot> {
        Ok(self.rates.get_all_rates().await?)
    }

    async fn pair_rate(&self, pair: CurrencyPair) -> Result<PairQuote> {
        Ok(self.rates.get_pair_rate(pair).await?)
    }

    async fn reconcile(&self, account: AccountId) -> Result<IntegrityReport> {
        let balances = self.store.read_balances(account).await?;
        if balances.is_empty() {
            return Err(WalletError::AccountNotFound(account));
        }
        let records = self.store.transaction_records(account).await?;

        let report = IntegrityReport::new(account, balances, net_balances(&records));
        if !report.is_consistent() {
            error!(account = %account, mismatches = ?report.mismatches, "Balances drifted from audit log");
        }
        Ok(report)
    }

    async fn begin(&self, progress: &mut OperationProgress) -> Result<Box<dyn LedgerTransaction>> {
        advance(progress, OperationStage::AcquireConnection);
        match self.store.begin().await {
            Ok(tx) => {
                advance(progress, OperationStage::BeginTx);
                Ok(tx)
            }
            Err(err) => {
                advance(progress, OperationStage::Failed);
                Err(err)
            }
        }
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    tx: Box<dyn LedgerTransaction>,
    progress: &mut OperationProgress,
    result: Result<T>,
) -> Result<T> {
    match result {
        Ok(value) => {
            advance(progress, OperationStage::Commit);
            match tx.commit().await {
                Ok(()) => {
                    advance(progress, OperationStage::Done);
                    Ok(value)
                }
                Err(err) => {
                    advance(progress, OperationStage::Failed);
                    error!(kind = progress.kind.as_str(), error = %err, "Commit failed");
                    Err(err)
                }
            }
        }
        Err(err) => {
            advance(progress, OperationStage::Rollback);
            let err = rollback(tx, err).await;
            advance(progress, OperationStage::Failed);

            if err.is_expected() {
                warn!(kind = progress.kind.as_str(), error = %err, "Operation rejected");
            } else {
                error!(kind = progress.kind.as_str(), error = %err, "Operation failed");
            }
            Err(err)
        }
    }
}

/// Roll back and fold a rollback failure into the triggering error.
async fn rollback(tx: Box<dyn LedgerTransaction>, err: WalletError) -> WalletError {
    match tx.rollback().await {
        Ok(()) => err,
        Err(rollback_err) => {
            error!(error = %err, rollback_error = %rollback_err, "Rollback failed");
            err.with_rollback_failure(rollback_err)
        }
    }
}

fn applied(outcome: AdjustOutcome, money: &Money) -> Result<WalletSnapshot> {
    match outcome {
        AdjustOutcome::Applied(snapshot) => Ok(snapshot),
        AdjustOutcome::InsufficientFunds => Err(WalletError::InsufficientFunds {
            currency: money.currency,
            requested: money.value,
        }),
    }
}

fn advance(progress: &mut OperationProgress, next: OperationStage) {
    match progress.transition_to(next) {
        Ok(()) => debug!(kind = progress.kind.as_str(), stage = ?next, "Operation stage"),
        Err(e) => error!(kind = progress.kind.as_str(), error = %e, "Unexpected operation stage"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use wallet_fx::{MockRateProvider, RateCache};
    use wallet_ledger::{FaultPoint, MemoryLedgerStore};

    struct Harness {
        engine: Arc<LedgerEngine>,
        store: MemoryLedgerStore,
        provider: Arc<MockRateProvider>,
    }

    fn harness() -> Harness {
        let store = MemoryLedgerStore::new();
        let provider = Arc::new(MockRateProvider::new("mock"));
        provider.set_pair_rate(CurrencyPair::new(Currency::Usd, Currency::Eur), dec!(0.9));
        provider.set_pair_rate(CurrencyPair::new(Currency::Eur, Currency::Usd), dec!(0.4));

        let rates = Arc::new(RateCache::new(provider.clone()));
        let engine = LedgerEngine::new(Arc::new(store.clone()), rates, LedgerConfig::default());

        Harness {
            engine: Arc::new(engine),
            store,
            provider,
        }
    }

    async fn open_with_usd(h: &Harness, usd: Decimal) -> AccountId {
        let ctx = RequestContext::new();
        let account = AccountId::new();
        h.engine.open_account(&ctx, account).await.unwrap();
        if usd > Decimal::ZERO {
            h.engine
                .deposit(&ctx, account, Currency::Usd, usd)
                .await
                .unwrap();
        }
        account
    }

    async fn balances(h: &Harness, account: AccountId) -> Balances {
        h.engine
            .get_balance(&RequestContext::new(), account)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_account_provisions_every_currency() {
        let h = harness();
        let ctx = RequestContext::new();
        let account = AccountId::new();

        let opened = h.engine.open_account(&ctx, account).await.unwrap();
        assert_eq!(opened.len(), Currency::ALL.len());

        let err = h.engine.open_account(&ctx, account).await.unwrap_err();
        assert!(matches!(err, WalletError::WalletsAlreadyProvisioned(id) if id == account));
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw() {
        let h = harness();
        let account = open_with_usd(&h, dec!(100)).await;
        let ctx = RequestContext::new();

        let snapshot = h
            .engine
            .withdraw(&ctx, account, Currency::Usd, dec!(30.50))
            .await
            .unwrap();

        assert_eq!(snapshot.currency, Currency::Usd);
        assert_eq!(snapshot.balance(), dec!(69.50));
        assert_eq!(snapshot.balances.get(Currency::Eur), Some(dec!(0)));

        let history = h.engine.transaction_history(&ctx, account).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].kind, OperationKind::Withdraw);
        assert_eq!(history[1].direction, Direction::Debit);
        assert_eq!(history[1].wallet_id, snapshot.wallet_id);
    }

    #[tokio::test]
    async fn test_withdraw_more_than_balance_changes_nothing() {
        let h = harness();
        let account = open_with_usd(&h, dec!(10)).await;
        let ctx = RequestContext::new();
        let events_before = h.store.event_count();

        let err = h
            .engine
            .withdraw(&ctx, account, Currency::Usd, dec!(20))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WalletError::InsufficientFunds { currency: Currency::Usd, requested } if requested == dec!(20)
        ));
        assert_eq!(balances(&h, account).await.get(Currency::Usd), Some(dec!(10)));
        assert_eq!(h.engine.transaction_history(&ctx, account).await.unwrap().len(), 1);
        assert_eq!(h.store.event_count(), events_before);
    }

    #[tokio::test]
    async fn test_exchange_scenario() {
        let h = harness();
        let account = open_with_usd(&h, dec!(100)).await;
        let ctx = RequestContext::new();

        let receipt = h
            .engine
            .exchange(&ctx, account, Currency::Usd, Currency::Eur, dec!(50))
            .await
            .unwrap();

        assert_eq!(receipt.rate, dec!(0.9));
        assert_eq!(receipt.target, Money::new(dec!(45), Currency::Eur));
        assert_eq!(receipt.balances().get(Currency::Usd), Some(dec!(50)));
        assert_eq!(receipt.balances().get(Currency::Eur), Some(dec!(45)));
        assert!(receipt.message.contains("45"));
        assert_eq!(receipt.snapshot.currency, Currency::Eur);
        assert_eq!(receipt.snapshot.balance(), dec!(45));

        let committed = balances(&h, account).await;
        assert_eq!(committed.get(Currency::Usd), Some(dec!(50)));
        assert_eq!(committed.get(Currency::Eur), Some(dec!(45)));
        assert_eq!(committed.get(Currency::Rub), Some(dec!(0)));

        let history = h.engine.transaction_history(&ctx, account).await.unwrap();
        let legs: Vec<_> = history
            .iter()
            .filter(|r| r.kind == OperationKind::Transfer)
            .collect();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].counterparty_wallet_id, Some(legs[1].wallet_id));
        assert_eq!(legs[1].counterparty_wallet_id, Some(legs[0].wallet_id));
        assert_eq!(legs[0].currency, Currency::Eur);
        assert_eq!(receipt.snapshot.wallet_id, legs[0].wallet_id);
    }

    #[tokio::test]
    async fn test_exchange_notification_carries_credit_leg_balances() {
        let h = harness();
        let account = open_with_usd(&h, dec!(100)).await;
        let ctx = RequestContext::new();
        h.engine
            .exchange(&ctx, account, Currency::Usd, Currency::Eur, dec!(50))
            .await
            .unwrap();

        let pending = h.store.pending_events(10).await.unwrap();
        assert_eq!(pending.len(), 2);

        let event = pending[1].notification().unwrap();
        assert_eq!(event.kind, OperationKind::Withdraw);
        assert_eq!(event.amount, dec!(45));
        assert_eq!(event.currency, Currency::Eur);
        assert_eq!(event.balance_after.get(Currency::Usd), Some(dec!(100)));
        assert_eq!(event.balance_after.get(Currency::Eur), Some(dec!(45)));
    }

    #[tokio::test]
    async fn test_failed_debit_leg_reverts_credit() {
        let h = harness();
        let account = open_with_usd(&h, dec!(10)).await;
        let ctx = RequestContext::new();

        let err = h
            .engine
            .exchange(&ctx, account, Currency::Usd, Currency::Eur, dec!(50))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
        let committed = balances(&h, account).await;
        assert_eq!(committed.get(Currency::Usd), Some(dec!(10)));
        assert_eq!(committed.get(Currency::Eur), Some(dec!(0)));
        assert_eq!(h.engine.transaction_history(&ctx, account).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rate_failure_aborts_before_mutation() {
        let h = harness();
        let account = open_with_usd(&h, dec!(100)).await;
        let ctx = RequestContext::new();

        let err = h
            .engine
            .exchange(&ctx, account, Currency::Usd, Currency::Rub, dec!(10))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "RATE_UNAVAILABLE");
        assert!(err.is_retryable());
        assert_eq!(balances(&h, account).await.get(Currency::Usd), Some(dec!(100)));
    }

    #[tokio::test]
    async fn test_exchange_validation() {
        let h = harness();
        let account = open_with_usd(&h, dec!(100)).await;
        let ctx = RequestContext::new();

        let same = h
            .engine
            .exchange(&ctx, account, Currency::Usd, Currency::Usd, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(same, WalletError::Validation(_)));

        // 0.01 EUR at 0.4 rounds to 0.00 USD
        let dust = h
            .engine
            .exchange(&ctx, account, Currency::Eur, Currency::Usd, dec!(0.01))
            .await
            .unwrap_err();
        assert!(matches!(dust, WalletError::Validation(_)));
        assert_eq!(h.provider.pair_calls(), 1);
    }

    #[tokio::test]
    async fn test_amount_validation() {
        let h = harness();
        let account = open_with_usd(&h, Decimal::ZERO).await;
        let ctx = RequestContext::new();

        for amount in [dec!(0), dec!(-5), dec!(1.001)] {
            let err = h
                .engine
                .deposit(&ctx, account, Currency::Usd, amount)
                .await
                .unwrap_err();
            assert!(matches!(err, WalletError::Validation(_)), "{amount}");
        }
        assert!(h
            .engine
            .deposit(&ctx, account, Currency::Usd, dec!(1.10))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_oversized_amounts_are_rejected() {
        let h = harness();
        h.provider
            .set_pair_rate(CurrencyPair::new(Currency::Usd, Currency::Rub), Decimal::MAX);
        let account = open_with_usd(&h, Money::MAX_VALUE).await;
        let ctx = RequestContext::new();

        let err = tokio_test::assert_err!(
            h.engine
                .exchange(&ctx, account, Currency::Usd, Currency::Rub, Decimal::MAX)
                .await
        );
        assert!(matches!(err, WalletError::Validation(_)));

        let err = tokio_test::assert_err!(
            h.engine
                .exchange(&ctx, account, Currency::Usd, Currency::Rub, dec!(10))
                .await
        );
        assert!(matches!(err, WalletError::Validation(_)));

        let err = tokio_test::assert_err!(
            h.engine
                .deposit(&ctx, account, Currency::Usd, dec!(1))
                .await
        );
        assert!(matches!(err, WalletError::Validation(_)));
        assert!(!err.is_retryable());

        let committed = balances(&h, account).await;
        assert_eq!(committed.get(Currency::Usd), Some(Money::MAX_VALUE));
        assert_eq!(committed.get(Currency::Rub), Some(dec!(0)));
    }

    #[tokio::test]
    async fn test_deposit_to_unknown_account() {
        let h = harness();
        let err = h
            .engine
            .deposit(&RequestContext::new(), AccountId::new(), Currency::Eur, dec!(5))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "WALLET_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_notification_thresholds() {
        let h = harness();
        let account = open_with_usd(&h, Decimal::ZERO).await;
        let ctx = RequestContext::new();

        h.engine
            .deposit(&ctx, account, Currency::Usd, dec!(0.99))
            .await
            .unwrap();
        assert_eq!(h.store.event_count(), 0);

        h.engine
            .deposit(&ctx, account, Currency::Usd, dec!(1))
            .await
            .unwrap();
        assert_eq!(h.store.event_count(), 1);

        h.engine
            .deposit(&ctx, account, Currency::Usd, dec!(10))
            .await
            .unwrap();
        assert_eq!(h.store.event_count(), 2);

        // 2 USD at 0.9 is 1.80 EUR, below the exchange threshold
        h.engine
            .exchange(&ctx, account, Currency::Usd, Currency::Eur, dec!(2))
            .await
            .unwrap();
        assert_eq!(h.store.event_count(), 2);

        h.engine
            .exchange(&ctx, account, Currency::Usd, Currency::Eur, dec!(3))
            .await
            .unwrap();
        assert_eq!(h.store.event_count(), 3);
    }

    #[tokio::test]
    async fn test_store_faults_roll_back() {
        let h = harness();
        let account = open_with_usd(&h, dec!(50)).await;
        let ctx = RequestContext::new();
        let events_before = h.store.event_count();

        for (point, code) in [
            (FaultPoint::AppendRecord, "STORE_UNAVAILABLE"),
            (FaultPoint::EnqueueEvent, "NOTIFICATION_ENQUEUE_FAILED"),
            (FaultPoint::Commit, "STORE_UNAVAILABLE"),
            (FaultPoint::Begin, "STORE_UNAVAILABLE"),
        ] {
            h.store.inject_fault(point);
            let err = h
                .engine
                .deposit(&ctx, account, Currency::Usd, dec!(25))
                .await
                .unwrap_err();
            assert_eq!(err.error_code(), code, "{point:?}");
        }

        assert_eq!(balances(&h, account).await.get(Currency::Usd), Some(dec!(50)));
        assert_eq!(h.engine.transaction_history(&ctx, account).await.unwrap().len(), 1);
        assert_eq!(h.store.event_count(), events_before);
    }

    #[tokio::test]
    async fn test_rollback_failure_is_merged() {
        let h = harness();
        let account = open_with_usd(&h, dec!(50)).await;
        let ctx = RequestContext::new();

        h.store.inject_fault(FaultPoint::AppendRecord);
        h.store.inject_fault(FaultPoint::Rollback);
        let err = h
            .engine
            .exchange(&ctx, account, Currency::Usd, Currency::Eur, dec!(10))
            .await
            .unwrap_err();

        match &err {
            WalletError::RollbackFailed { error, rollback } => {
                assert!(error.to_string().contains("audit insert"));
                assert!(rollback.to_string().contains("rollback"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.root_cause().error_code(), "STORE_UNAVAILABLE");
        assert_eq!(balances(&h, account).await.get(Currency::Usd), Some(dec!(50)));
    }

    #[tokio::test]
    async fn test_deadline_rolls_back_partial_exchange() {
        let h = harness();
        let account = open_with_usd(&h, dec!(100)).await;

        // Hold the USD row so the debit leg blocks after the credit leg.
        let mut holder = h.store.begin().await.unwrap();
        let _ = holder
            .adjust_balance(account, Currency::Usd, dec!(1), Direction::Debit)
            .await
            .unwrap();

        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        let err = h
            .engine
            .exchange(&ctx, account, Currency::Usd, Currency::Eur, dec!(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::DeadlineExceeded));

        holder.rollback().await.unwrap();
        let committed = balances(&h, account).await;
        assert_eq!(committed.get(Currency::Usd), Some(dec!(100)));
        assert_eq!(committed.get(Currency::Eur), Some(dec!(0)));

        // The abandoned transaction released its EUR row lock.
        h.engine
            .deposit(&RequestContext::new(), account, Currency::Eur, dec!(1))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_withdrawals_never_overdraw() {
        let h = harness();
        let account = open_with_usd(&h, dec!(100)).await;

        let tasks = (0..10).map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .withdraw(&RequestContext::new(), account, Currency::Usd, dec!(11))
                    .await
            })
        });
        let results = futures::future::join_all(tasks).await;

        let successes = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(Ok(_)) | Ok(Err(WalletError::InsufficientFunds { .. })))));
        assert_eq!(successes, 9);
        assert_eq!(balances(&h, account).await.get(Currency::Usd), Some(dec!(1)));
    }

    #[tokio::test]
    async fn test_rates_are_cached() {
        let h = harness();
        h.provider.set_rate(Currency::Usd, dec!(1));
        h.provider.set_rate(Currency::Eur, dec!(0.9));
        let ctx = RequestContext::new();

        let first = h.engine.get_all_currency_rates(&ctx).await.unwrap();
        let second = h.engine.get_all_currency_rates(&ctx).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.rates.get(&Currency::Eur), Some(&dec!(0.9)));
        assert_eq!(h.provider.all_rates_calls(), 1);

        let quote = h
            .engine
            .get_pair_rate(&ctx, Currency::Usd, Currency::Eur)
            .await
            .unwrap();
        assert_eq!(quote.rate, dec!(0.9));
    }

    #[tokio::test]
    async fn test_verify_integrity() {
        let h = harness();
        let account = open_with_usd(&h, dec!(100)).await;
        let ctx = RequestContext::new();
        h.engine
            .exchange(&ctx, account, Currency::Usd, Currency::Eur, dec!(40))
            .await
            .unwrap();
        h.engine
            .withdraw(&ctx, account, Currency::Eur, dec!(6))
            .await
            .unwrap();

        let report = h.engine.verify_integrity(&ctx, account).await.unwrap();

        assert!(report.is_consistent());
        assert_eq!(report.balances.get(Currency::Eur), Some(dec!(30)));
    }

    #[tokio::test]
    async fn test_verify_integrity_of_unknown_account() {
        let h = harness();
        let account = AccountId::new();

        let err = tokio_test::assert_err!(
            h.engine
                .verify_integrity(&RequestContext::new(), account)
                .await
        );
        assert!(matches!(err, WalletError::AccountNotFound(id) if id == account));
        assert_eq!(err.error_code(), "ACCOUNT_NOT_FOUND");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deposit(i64),
        Withdraw(i64),
        Exchange(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..50_000).prop_map(Op::Deposit),
            (1i64..50_000).prop_map(Op::Withdraw),
            (1i64..50_000).prop_map(Op::Exchange),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_balances_match_audit_log(ops in proptest::collection::vec(op_strategy(), 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let h = harness();
                let account = open_with_usd(&h, Decimal::ZERO).await;
                let ctx = RequestContext::new();

                for op in ops {
                    let result = match op {
                        Op::Deposit(cents) => h
                            .engine
                            .deposit(&ctx, account, Currency::Usd, Decimal::new(cents, 2))
                            .await
                            .map(|_| ()),
                        Op::Withdraw(cents) => h
                            .engine
                            .withdraw(&ctx, account, Currency::Usd, Decimal::new(cents, 2))
                            .await
                            .map(|_| ()),
                        Op::Exchange(cents) => h
                            .engine
                            .exchange(&ctx, account, Currency::Usd, Currency::Eur, Decimal::new(cents, 2))
                            .await
                            .map(|_| ()),
                    };
                    if let Err(err) = result {
                        assert!(err.is_expected(), "unexpected error: {err}");
                    }

                    let report = h.engine.verify_integrity(&ctx, account).await.unwrap();
                    assert!(report.is_consistent(), "{report:?}");
                    assert!(report.balances.iter().all(|(_, b)| b >= Decimal::ZERO));
                }
            });
        }
    }
}
