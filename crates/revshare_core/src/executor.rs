//! crates/revshare_core/src/executor.rs
//!
//! The Payout Executor: drives payout rows through
//! `pending -> processing -> paid | failed` against the external transfer
//! provider, plus the admin transitions (fail, retry, reconcile).
//!
//! A payout gets at most one transfer attempt per claim. The attempt is
//! claimed in the store before the provider is called, carries
//! `<payout id>:<attempt>` as idempotency key, and is never retried inside the
//! same call. An admin retry after a definite failure bumps the attempt; a
//! retry after a timeout keeps it, so the provider deduplicates a transfer that
//! did go through. A timeout leaves the outcome unknown and the payout failed
//! until an admin reconciles.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{InstructorConnectAccount, InstructorPayout, PayoutStatus, PayoutTransition};
use crate::error::{invalid, ServiceError, ServiceResult};
use crate::ports::{
    ConnectAccountDirectory, PayoutStatusChange, PayoutStore, TransferError, TransferProvider,
    TransferRequest,
};

const OUTCOME_UNKNOWN: &str =
    "Transfer outcome unknown after timeout; reconcile with the provider before retrying";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub transfer_timeout: Duration,
    /// Upper bound on payouts handled per batch call.
    pub batch_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(30),
            batch_limit: 100,
        }
    }
}

/// Result of one execution attempt. None of these are errors: failures are
/// recorded on the payout row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// `transfer_id` is `None` for zero-amount payouts.
    Paid { transfer_id: Option<String> },
    Failed { reason: String },
    OutcomeUnknown { reason: String },
    /// Destination not eligible yet; the payout stays pending.
    Deferred { reason: String },
    /// The provider accepted the transfer but the payout row had already been
    /// moved by someone else. Needs an admin reconcile with `transfer_id`.
    TransferUnrecorded { transfer_id: String, reason: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Paid { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub paid: usize,
    pub failed: usize,
    pub unknown: usize,
    pub deferred: usize,
    pub unrecorded: usize,
}

enum Eligibility {
    Eligible(InstructorConnectAccount),
    Ineligible(String),
    Unreachable(String),
}

pub struct PayoutExecutor {
    payouts: Arc<dyn PayoutStore>,
    accounts: Arc<dyn ConnectAccountDirectory>,
    provider: Arc<dyn TransferProvider>,
    config: ExecutorConfig,
}

impl PayoutExecutor {
    pub fn new(
        payouts: Arc<dyn PayoutStore>,
        accounts: Arc<dyn ConnectAccountDirectory>,
        provider: Arc<dyn TransferProvider>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            payouts,
            accounts,
            provider,
            config,
        }
    }

    /// Claims eligible pending payouts for execution. Ineligible ones stay
    /// pending. Returns how many were claimed.
    pub async fn process_pending_payouts(&self) -> ServiceResult<usize> {
        let pending = self
            .payouts
            .payouts_with_status(PayoutStatus::Pending, self.config.batch_limit)
            .await?;
        let mut claimed = 0;

        for payout in &pending {
            match self.eligibility(payout.instructor_id).await {
                Ok(Eligibility::Eligible(_)) => {}
                Ok(Eligibility::Ineligible(reason)) | Ok(Eligibility::Unreachable(reason)) => {
                    debug!(payout_id = %payout.id, reason, "Payout left pending");
                    continue;
                }
                Err(e) => {
                    error!(payout_id = %payout.id, "Eligibility check failed: {:?}", e);
                    continue;
                }
            }
            match self
                .payouts
                .update_payout_status(payout.id, PayoutStatus::Pending, &PayoutStatusChange::Processing, Utc::now())
                .await
            {
                Ok(true) => claimed += 1,
                Ok(false) => debug!(payout_id = %payout.id, "Payout claimed elsewhere"),
                Err(e) => error!(payout_id = %payout.id, "Failed to claim payout: {:?}", e),
            }
        }

        info!(candidates = pending.len(), claimed, "Pending payouts processed");
        Ok(claimed)
    }

    /// Executes every claimed payout whose transfer has not started.
    pub async fn execute_processing_payouts(&self) -> ServiceResult<ExecutionReport> {
        let batch = self
            .payouts
            .payouts_with_status(PayoutStatus::Processing, self.config.batch_limit)
            .await?;
        let mut report = ExecutionReport::default();

        for payout in &batch {
            match self.execute_payout(payout.id).await {
                Ok(ExecutionOutcome::Paid { .. }) => report.paid += 1,
                Ok(ExecutionOutcome::Failed { .. }) => report.failed += 1,
                Ok(ExecutionOutcome::OutcomeUnknown { .. }) => report.unknown += 1,
                Ok(ExecutionOutcome::Deferred { .. }) => report.deferred += 1,
                Ok(ExecutionOutcome::TransferUnrecorded { .. }) => report.unrecorded += 1,
                Err(e) => error!(payout_id = %payout.id, "Payout execution aborted: {:?}", e),
            }
        }

        info!(?report, "Payout execution batch finished");
        Ok(report)
    }

    /// Attempts the transfer for one pending or claimed payout.
    pub async fn execute_payout(&self, payout_id: Uuid) -> ServiceResult<ExecutionOutcome> {
        let payout = self.payouts.get_payout(payout_id).await?;
        match payout.status {
            PayoutStatus::Pending => {}
            PayoutStatus::Processing if payout.transfer_started_at.is_none() => {}
            PayoutStatus::Processing => {
                return Err(ServiceError::InvalidTransition {
                    entity: "payout",
                    id: payout_id,
                    from: "processing (transfer already attempted)".to_string(),
                    to: PayoutStatus::Paid.to_string(),
                })
            }
            status => {
                PayoutTransition::Complete.check(payout_id, status)?;
            }
        }

        let account = match self.eligibility(payout.instructor_id).await? {
            Eligibility::Eligible(account) => account,
            Eligibility::Ineligible(reason) => return self.defer(&payout, reason).await,
            Eligibility::Unreachable(reason) => {
                let reason = format!("Could not verify destination account: {}", reason);
                return self.fail(&payout, reason).await;
            }
        };

        if payout.status == PayoutStatus::Pending {
            self.transition(&payout, PayoutStatus::Pending, PayoutStatusChange::Processing)
                .await?;
        }
        if !self.payouts.claim_transfer(payout_id, Utc::now()).await? {
            return Err(ServiceError::InvalidTransition {
                entity: "payout",
                id: payout_id,
                from: "processing (transfer already attempted)".to_string(),
                to: PayoutStatus::Paid.to_string(),
            });
        }

        let amount = payout.amount();
        if amount.is_zero() {
            self.transition(&payout, PayoutStatus::Processing, PayoutStatusChange::Paid { transfer_id: None })
                .await?;
            info!(%payout_id, "Zero-amount payout closed without a transfer");
            return Ok(ExecutionOutcome::Paid { transfer_id: None });
        }

        let request = TransferRequest {
            destination_account_id: account.external_account_id.clone(),
            amount,
            currency: payout.currency.clone(),
            idempotency_key: payout.idempotency_key(),
            description: format!("Instructor payout {}", payout.period),
        };

        let result = match tokio::time::timeout(self.config.transfer_timeout, self.provider.create_transfer(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::TimedOut),
        };

        match result {
            Ok(receipt) => {
                let change = PayoutStatusChange::Paid {
                    transfer_id: Some(receipt.transfer_id.clone()),
                };
                if !self
                    .payouts
                    .update_payout_status(payout_id, PayoutStatus::Processing, &change, Utc::now())
                    .await?
                {
                    let current = self.payouts.get_payout(payout_id).await?;
                    let reason = format!(
                        "Transfer {} succeeded but the payout was moved to {} meanwhile; reconcile it",
                        receipt.transfer_id, current.status
                    );
                    error!(
                        %payout_id,
                        transfer_id = %receipt.transfer_id,
                        status = %current.status,
                        %amount,
                        "Transfer succeeded but could not be recorded on the payout"
                    );
                    return Ok(ExecutionOutcome::TransferUnrecorded {
                        transfer_id: receipt.transfer_id,
                        reason,
                    });
                }
                self.credit_account(&payout, amount).await;
                info!(%payout_id, transfer_id = %receipt.transfer_id, %amount, "Payout paid");
                Ok(ExecutionOutcome::Paid {
                    transfer_id: Some(receipt.transfer_id),
                })
            }
            Err(TransferError::TimedOut) => {
                self.transition(
                    &payout,
                    PayoutStatus::Processing,
                    PayoutStatusChange::Failed {
                        reason: OUTCOME_UNKNOWN.to_string(),
                    },
                )
                .await?;
                error!(%payout_id, "Transfer timed out; outcome unknown");
                Ok(ExecutionOutcome::OutcomeUnknown {
                    reason: OUTCOME_UNKNOWN.to_string(),
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.transition(
                    &payout,
                    PayoutStatus::Processing,
                    PayoutStatusChange::Failed { reason: reason.clone() },
                )
                .await?;
                warn!(%payout_id, reason, "Transfer failed");
                Ok(ExecutionOutcome::Failed { reason })
            }
        }
    }

    /// Admin escape hatch for failures found out of band.
    pub async fn mark_payout_as_failed(&self, payout_id: Uuid, reason: &str) -> ServiceResult<InstructorPayout> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(invalid("A reason is required to fail a payout"));
        }
        let payout = self.payouts.get_payout(payout_id).await?;
        PayoutTransition::Fail.check(payout_id, payout.status)?;
        self.transition(
            &payout,
            payout.status,
            PayoutStatusChange::Failed {
                reason: reason.to_string(),
            },
        )
        .await?;
        warn!(%payout_id, from = %payout.status, reason, "Payout marked failed by admin");
        Ok(self.payouts.get_payout(payout_id).await?)
    }

    /// Puts a failed payout back to pending. Never called automatically.
    pub async fn retry_payout(&self, payout_id: Uuid) -> ServiceResult<InstructorPayout> {
        let payout = self.payouts.get_payout(payout_id).await?;
        PayoutTransition::Retry.check(payout_id, payout.status)?;
        // After a timeout the first transfer may exist; reuse its key.
        let next_attempt = payout.error_message.as_deref() != Some(OUTCOME_UNKNOWN);
        self.transition(&payout, PayoutStatus::Failed, PayoutStatusChange::Pending { next_attempt })
            .await?;
        info!(%payout_id, previous_error = ?payout.error_message, next_attempt, "Payout queued for retry");
        Ok(self.payouts.get_payout(payout_id).await?)
    }

    /// Admin correction once the provider confirms a transfer this service
    /// could not observe (typically after a timeout).
    pub async fn reconcile_transfer(&self, payout_id: Uuid, transfer_id: &str) -> ServiceResult<InstructorPayout> {
        let transfer_id = transfer_id.trim();
        if transfer_id.is_empty() {
            return Err(invalid("A transfer id is required to reconcile a payout"));
        }
        let payout = self.payouts.get_payout(payout_id).await?;
        PayoutTransition::Reconcile.check(payout_id, payout.status)?;
        self.transition(
            &payout,
            payout.status,
            PayoutStatusChange::Paid {
                transfer_id: Some(transfer_id.to_string()),
            },
        )
        .await?;
        self.credit_account(&payout, payout.amount()).await;
        warn!(%payout_id, transfer_id, from = %payout.status, "Payout reconciled as paid");
        Ok(self.payouts.get_payout(payout_id).await?)
    }

    async fn eligibility(&self, instructor_id: Uuid) -> ServiceResult<Eligibility> {
        let Some(account) = self.accounts.connect_account(instructor_id).await? else {
            return Ok(Eligibility::Ineligible("Instructor has no connect account".to_string()));
        };
        if !account.can_receive_payouts() {
            return Ok(Eligibility::Ineligible("Connect account cannot receive payouts".to_string()));
        }
        match self.provider.account_status(&account.external_account_id).await {
            Ok(status) if status.payouts_enabled => Ok(Eligibility::Eligible(account)),
            Ok(_) => Ok(Eligibility::Ineligible(
                "Provider reports payouts disabled for the account".to_string(),
            )),
            Err(e) => Ok(Eligibility::Unreachable(e.to_string())),
        }
    }

    async fn defer(&self, payout: &InstructorPayout, reason: String) -> ServiceResult<ExecutionOutcome> {
        if payout.status == PayoutStatus::Processing {
            self.transition(
                payout,
                PayoutStatus::Processing,
                PayoutStatusChange::Pending { next_attempt: false },
            )
            .await?;
        }
        warn!(payout_id = %payout.id, reason, "Payout deferred");
        Ok(ExecutionOutcome::Deferred { reason })
    }

    async fn fail(&self, payout: &InstructorPayout, reason: String) -> ServiceResult<ExecutionOutcome> {
        self.transition(
            payout,
            payout.status,
            PayoutStatusChange::Failed { reason: reason.clone() },
        )
        .await?;
        warn!(payout_id = %payout.id, reason, "Payout failed before transfer");
        Ok(ExecutionOutcome::Failed { reason })
    }

    async fn transition(
        &self,
        payout: &InstructorPayout,
        expected: PayoutStatus,
        change: PayoutStatusChange,
    ) -> ServiceResult<()> {
        if self
            .payouts
            .update_payout_status(payout.id, expected, &change, Utc::now())
            .await?
        {
            return Ok(());
        }
        let current = self.payouts.get_payout(payout.id).await?;
        Err(ServiceError::InvalidTransition {
            entity: "payout",
            id: payout.id,
            from: current.status.to_string(),
            to: change.target().to_string(),
        })
    }

    async fn credit_account(&self, payout: &InstructorPayout, amount: Decimal) {
        if let Err(e) = self
            .accounts
            .record_payout(payout.instructor_id, amount, Utc::now())
            .await
        {
            error!(
                payout_id = %payout.id,
                instructor_id = %payout.instructor_id,
                "Payout is paid but the lifetime total was not updated: {:?}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountingPeriod, OnboardingStatus, PayoutBreakdown, PayoutCalculation};
    use crate::memory::InMemoryStore;
    use crate::ports::{AccountStatus, TransferReceipt};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted answers and records every request.
    struct ScriptedProvider {
        answers: Mutex<VecDeque<Result<TransferReceipt, TransferError>>>,
        status: Result<AccountStatus, TransferError>,
        delay: Option<Duration>,
        requests: Mutex<Vec<TransferRequest>>,
        status_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(answers: Vec<Result<TransferReceipt, TransferError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                status: Ok(AccountStatus {
                    payouts_enabled: true,
                    charges_enabled: true,
                }),
                delay: None,
                requests: Mutex::new(Vec::new()),
                status_calls: AtomicUsize::new(0),
            }
        }

        fn transfers(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl TransferProvider for ScriptedProvider {
        async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
            self.requests.lock().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransferError::Unavailable("no scripted answer".into())))
        }

        async fn account_status(&self, _account_id: &str) -> Result<AccountStatus, TransferError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.status.clone()
        }
    }

    fn account(instructor_id: Uuid, payouts_enabled: bool) -> InstructorConnectAccount {
        InstructorConnectAccount {
            instructor_id,
            external_account_id: format!("acct_{}", instructor_id.simple()),
            onboarding_status: OnboardingStatus::Complete,
            payouts_enabled,
            charges_enabled: true,
            total_paid_out: Decimal::ZERO,
            last_payout_at: None,
            disabled_at: None,
            disabled_reason: None,
        }
    }

    async fn seed_payout(store: &InMemoryStore, amount: Decimal, payouts_enabled: bool) -> InstructorPayout {
        let instructor_id = Uuid::new_v4();
        store.upsert_connect_account(account(instructor_id, payouts_enabled));
        let now = Utc::now();
        let payout = InstructorPayout {
            id: Uuid::new_v4(),
            instructor_id,
            period: AccountingPeriod::new(3, 2025).unwrap(),
            calculation: PayoutCalculation {
                instructor_minutes: 10,
                platform_minutes: 10,
                platform_revenue: amount,
                engagement_percentage: Decimal::ONE,
                commission_rate: dec!(0.20),
                payout_amount: amount,
                breakdown: PayoutBreakdown::default(),
            },
            currency: "EUR".into(),
            status: PayoutStatus::Pending,
            transfer_id: None,
            error_message: None,
            transfer_started_at: None,
            transfer_attempt: 0,
            paid_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_payout(&payout).await.unwrap();
        payout
    }

    fn executor(store: &Arc<InMemoryStore>, provider: &Arc<ScriptedProvider>, timeout: Duration) -> PayoutExecutor {
        PayoutExecutor::new(
            store.clone(),
            store.clone(),
            provider.clone(),
            ExecutorConfig {
                transfer_timeout: timeout,
                batch_limit: 10,
            },
        )
    }

    fn receipt(id: &str) -> Result<TransferReceipt, TransferError> {
        Ok(TransferReceipt {
            transfer_id: id.to_string(),
        })
    }

    #[tokio::test]
    async fn successful_transfer_pays_and_credits_lifetime_total() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![receipt("tr_1")]));
        let exec = executor(&store, &provider, Duration::from_secs(5));
        let payout = seed_payout(&store, dec!(42.50), true).await;

        let outcome = exec.execute_payout(payout.id).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Paid { transfer_id: Some("tr_1".into()) });

        let stored = store.get_payout(payout.id).await.unwrap();
        assert_eq!(stored.status, PayoutStatus::Paid);
        assert_eq!(stored.transfer_id.as_deref(), Some("tr_1"));
        let acct = store.connect_account(payout.instructor_id).await.unwrap().unwrap();
        assert_eq!(acct.total_paid_out, dec!(42.50));

        let sent = provider.requests.lock()[0].clone();
        assert_eq!(sent.idempotency_key, format!("{}:0", payout.id));
        assert_eq!(sent.amount, dec!(42.50));
    }

    #[tokio::test]
    async fn disabled_payouts_leave_the_payout_pending() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![receipt("tr_never")]));
        let exec = executor(&store, &provider, Duration::from_secs(5));
        let payout = seed_payout(&store, dec!(10), false).await;

        let outcome = exec.execute_payout(payout.id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Deferred { .. }));
        assert_eq!(store.get_payout(payout.id).await.unwrap().status, PayoutStatus::Pending);
        assert_eq!(provider.transfers(), 0);

        assert_eq!(exec.process_pending_payouts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_transfer_fails_without_retrying() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(TransferError::Rejected("insufficient platform balance".into())),
            receipt("tr_2"),
        ]));
        let exec = executor(&store, &provider, Duration::from_secs(5));
        let payout = seed_payout(&store, dec!(10), true).await;

        let outcome = exec.execute_payout(payout.id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        assert_eq!(provider.transfers(), 1);

        let stored = store.get_payout(payout.id).await.unwrap();
        assert_eq!(stored.status, PayoutStatus::Failed);
        assert!(stored.error_message.unwrap().contains("insufficient platform balance"));

        // Failed payouts are not picked up again on their own.
        assert!(exec.execute_payout(payout.id).await.is_err());
        assert_eq!(exec.process_pending_payouts().await.unwrap(), 0);

        exec.retry_payout(payout.id).await.unwrap();
        let outcome = exec.execute_payout(payout.id).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(provider.transfers(), 2);

        // The rejected key is spent at the provider; the retry needs a new one.
        let keys: Vec<_> = provider.requests.lock().iter().map(|r| r.idempotency_key.clone()).collect();
        assert_eq!(keys, vec![format!("{}:0", payout.id), format!("{}:1", payout.id)]);
        assert_eq!(store.get_payout(payout.id).await.unwrap().transfer_attempt, 1);
    }

    #[tokio::test]
    async fn retry_after_timeout_reuses_the_idempotency_key() {
        let store = Arc::new(InMemoryStore::new());
        let mut scripted = ScriptedProvider::new(vec![receipt("tr_dup"), receipt("tr_dup")]);
        scripted.delay = Some(Duration::from_millis(200));
        let provider = Arc::new(scripted);
        let exec = executor(&store, &provider, Duration::from_millis(20));
        let payout = seed_payout(&store, dec!(15), true).await;

        let outcome = exec.execute_payout(payout.id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::OutcomeUnknown { .. }));

        let retried = exec.retry_payout(payout.id).await.unwrap();
        assert_eq!(retried.status, PayoutStatus::Pending);
        assert_eq!(retried.transfer_attempt, 0);
        assert_eq!(retried.idempotency_key(), payout.idempotency_key());
    }

    #[tokio::test]
    async fn admin_failure_during_transfer_surfaces_the_transfer_id() {
        let store = Arc::new(InMemoryStore::new());
        let mut scripted = ScriptedProvider::new(vec![receipt("tr_inflight")]);
        scripted.delay = Some(Duration::from_millis(200));
        let provider = Arc::new(scripted);
        let exec = Arc::new(executor(&store, &provider, Duration::from_secs(5)));
        let payout = seed_payout(&store, dec!(25), true).await;

        let running = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.execute_payout(payout.id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let failed = exec.mark_payout_as_failed(payout.id, "bank flagged the account").await.unwrap();
        assert_eq!(failed.status, PayoutStatus::Failed);

        let outcome = running.await.unwrap().unwrap();
        match outcome {
            ExecutionOutcome::TransferUnrecorded { transfer_id, .. } => assert_eq!(transfer_id, "tr_inflight"),
            other => panic!("unexpected outcome {:?}", other),
        }
        let stored = store.get_payout(payout.id).await.unwrap();
        assert_eq!(stored.status, PayoutStatus::Failed);
        let acct = store.connect_account(payout.instructor_id).await.unwrap().unwrap();
        assert_eq!(acct.total_paid_out, Decimal::ZERO);

        let reconciled = exec.reconcile_transfer(payout.id, "tr_inflight").await.unwrap();
        assert_eq!(reconciled.status, PayoutStatus::Paid);
    }

    #[tokio::test]
    async fn timeout_is_recorded_as_unknown_and_reconciled_by_admin() {
        let store = Arc::new(InMemoryStore::new());
        let mut scripted = ScriptedProvider::new(vec![receipt("tr_late")]);
        scripted.delay = Some(Duration::from_secs(5));
        let provider = Arc::new(scripted);
        let exec = executor(&store, &provider, Duration::from_millis(20));
        let payout = seed_payout(&store, dec!(99.99), true).await;

        let outcome = exec.execute_payout(payout.id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::OutcomeUnknown { .. }));
        let stored = store.get_payout(payout.id).await.unwrap();
        assert_eq!(stored.status, PayoutStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some(OUTCOME_UNKNOWN));

        let reconciled = exec.reconcile_transfer(payout.id, "tr_late").await.unwrap();
        assert_eq!(reconciled.status, PayoutStatus::Paid);
        let acct = store.connect_account(payout.instructor_id).await.unwrap().unwrap();
        assert_eq!(acct.total_paid_out, dec!(99.99));
    }

    #[tokio::test]
    async fn paid_payout_cannot_be_executed_failed_or_retried() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![receipt("tr_3")]));
        let exec = executor(&store, &provider, Duration::from_secs(5));
        let payout = seed_payout(&store, dec!(10), true).await;
        exec.execute_payout(payout.id).await.unwrap();

        for result in [
            exec.execute_payout(payout.id).await.map(|_| ()),
            exec.mark_payout_as_failed(payout.id, "oops").await.map(|_| ()),
            exec.retry_payout(payout.id).await.map(|_| ()),
            exec.reconcile_transfer(payout.id, "tr_x").await.map(|_| ()),
        ] {
            assert!(matches!(result, Err(ServiceError::InvalidTransition { .. })));
        }
        assert_eq!(provider.transfers(), 1);
    }

    #[tokio::test]
    async fn concurrent_executions_attempt_one_transfer() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![receipt("tr_a"), receipt("tr_b")]));
        let exec = Arc::new(executor(&store, &provider, Duration::from_secs(5)));
        let payout = seed_payout(&store, dec!(10), true).await;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let exec = exec.clone();
                tokio::spawn(async move { exec.execute_payout(payout.id).await })
            })
            .collect();
        let mut successes = 0;
        for h in handles {
            if let Ok(outcome) = h.await.unwrap() {
                if outcome.is_success() {
                    successes += 1;
                }
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(provider.transfers(), 1);
    }

    #[tokio::test]
    async fn batch_claims_then_executes() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![receipt("tr_1"), receipt("tr_2")]));
        let exec = executor(&store, &provider, Duration::from_secs(5));
        seed_payout(&store, dec!(10), true).await;
        seed_payout(&store, dec!(20), true).await;
        seed_payout(&store, dec!(30), false).await;

        assert_eq!(exec.process_pending_payouts().await.unwrap(), 2);
        let report = exec.execute_processing_payouts().await.unwrap();
        assert_eq!(report.paid, 2);
        assert_eq!(provider.transfers(), 2);
    }

    #[tokio::test]
    async fn zero_amount_closes_without_transfer() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let exec = executor(&store, &provider, Duration::from_secs(5));
        let payout = seed_payout(&store, Decimal::ZERO, true).await;

        assert_eq!(
            exec.execute_payout(payout.id).await.unwrap(),
            ExecutionOutcome::Paid { transfer_id: None }
        );
        assert_eq!(provider.transfers(), 0);
    }

    #[tokio::test]
    async fn unreachable_status_check_fails_the_payout() {
        let store = Arc::new(InMemoryStore::new());
        let mut scripted = ScriptedProvider::new(vec![receipt("tr_1")]);
        scripted.status = Err(TransferError::Unavailable("connection refused".into()));
        let provider = Arc::new(scripted);
        let exec = executor(&store, &provider, Duration::from_secs(5));
        let payout = seed_payout(&store, dec!(10), true).await;

        let outcome = exec.execute_payout(payout.id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.transfers(), 0);
        assert_eq!(store.get_payout(payout.id).await.unwrap().status, PayoutStatus::Failed);
    }

    #[tokio::test]
    async fn admin_can_fail_a_pending_payout() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let exec = executor(&store, &provider, Duration::from_secs(5));
        let payout = seed_payout(&store, dec!(10), true).await;

        assert!(matches!(
            exec.mark_payout_as_failed(payout.id, "  ").await,
            Err(ServiceError::InvalidInput(_))
        ));
        let failed = exec.mark_payout_as_failed(payout.id, "bank reported reversal").await.unwrap();
        assert_eq!(failed.status, PayoutStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("bank reported reversal"));
    }
}
