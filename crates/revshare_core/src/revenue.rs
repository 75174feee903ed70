//! crates/revshare_core/src/revenue.rs
//!
//! The Revenue Ledger: idempotent recording of subscription payment events,
//! and the aggregate revenue queries the Payout Calculator and admins use.
//!
//! Realized revenue comes from ledger rows. MRR/ARR come from the contracted
//! price of currently active subscriptions; the two are never mixed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{AccountingPeriod, RevenueStatus, SubscriptionRevenue};
use crate::error::{invalid, ServiceError, ServiceResult};
use crate::ports::{RevenueStatusChange, RevenueStore, SubscriptionDirectory};

const MONEY_SCALE: u32 = 2;

/// A "payment succeeded" event for one billing cycle.
#[derive(Debug, Clone)]
pub struct RevenueEvent {
    pub subscription_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    /// Upstream invoice id; the idempotency key when present.
    pub invoice_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub payment_method: Option<String>,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    /// Defaults to the time of recording.
    pub paid_at: Option<DateTime<Utc>>,
}

/// A "payment failed" event for one invoice.
#[derive(Debug, Clone)]
pub struct PaymentFailureEvent {
    pub subscription_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub invoice_id: String,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub reason: String,
}

/// What a ledger write did. Redeliveries are outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Created(SubscriptionRevenue),
    AlreadyRecorded(SubscriptionRevenue),
    StatusChanged(SubscriptionRevenue),
}

impl RecordOutcome {
    pub fn revenue(&self) -> &SubscriptionRevenue {
        match self {
            RecordOutcome::Created(r) | RecordOutcome::AlreadyRecorded(r) | RecordOutcome::StatusChanged(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevenueMetrics {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_revenue: Decimal,
    pub previous_period_revenue: Decimal,
    /// Percent change against the preceding window of equal length; zero
    /// when that window had no revenue.
    pub growth_rate: Decimal,
    pub mrr: Decimal,
    pub arr: Decimal,
    pub transaction_count: i64,
    pub failed_count: i64,
    pub refunded_count: i64,
    pub charged_back_count: i64,
    pub average_transaction_value: Decimal,
    pub revenue_by_plan: BTreeMap<String, Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyRevenue {
    pub period: AccountingPeriod,
    pub total_revenue: Decimal,
    pub transaction_count: i64,
    pub average_transaction_value: Decimal,
    pub failed_payments: i64,
    /// MRR at the last instant of the month.
    pub mrr: Decimal,
}

#[derive(Debug, Clone, Copy)]
enum Reversal {
    Refund,
    Chargeback,
}

impl Reversal {
    fn status(&self) -> RevenueStatus {
        match self {
            Reversal::Refund => RevenueStatus::Refunded,
            Reversal::Chargeback => RevenueStatus::ChargedBack,
        }
    }
}

pub struct RevenueLedger {
    store: Arc<dyn RevenueStore>,
    subscriptions: Arc<dyn SubscriptionDirectory>,
}

impl RevenueLedger {
    pub fn new(store: Arc<dyn RevenueStore>, subscriptions: Arc<dyn SubscriptionDirectory>) -> Self {
        Self { store, subscriptions }
    }

    /// Records a paid invoice. A redelivery of an already-paid invoice is a
    /// no-op; a paid event for a pending or failed invoice marks it paid.
    pub async fn record_revenue(&self, event: RevenueEvent) -> ServiceResult<RecordOutcome> {
        check_money(event.amount, &event.currency)?;
        check_billing_period(event.billing_period_start, event.billing_period_end)?;
        let invoice_id = normalize_invoice(event.invoice_id.as_deref())?;
        let paid_at = event.paid_at.unwrap_or_else(Utc::now);

        if let Some(invoice) = invoice_id.as_deref() {
            if let Some(existing) = self.store.find_by_invoice(invoice).await? {
                return self.settle_existing(existing, paid_at).await;
            }
        }

        let revenue = SubscriptionRevenue {
            id: Uuid::new_v4(),
            subscription_id: event.subscription_id,
            amount: event.amount,
            currency: event.currency.to_uppercase(),
            invoice_id: invoice_id.clone(),
            payment_intent_id: event.payment_intent_id,
            payment_method: event.payment_method,
            billing_period_start: event.billing_period_start,
            billing_period_end: event.billing_period_end,
            status: RevenueStatus::Paid,
            paid_at: Some(paid_at),
            failed_at: None,
            failure_reason: None,
            refunded_at: None,
            refund_amount: None,
            refund_reason: None,
            created_at: Utc::now(),
        };

        if self.store.insert_revenue(&revenue).await? {
            info!(
                revenue_id = %revenue.id,
                invoice_id = ?revenue.invoice_id,
                amount = %revenue.amount,
                "Revenue recorded"
            );
            return Ok(RecordOutcome::Created(revenue));
        }

        // Lost an insert race against a concurrent delivery of the same invoice.
        let existing = self.existing_invoice(invoice_id.as_deref()).await?;
        self.settle_existing(existing, paid_at).await
    }

    async fn settle_existing(
        &self,
        existing: SubscriptionRevenue,
        paid_at: DateTime<Utc>,
    ) -> ServiceResult<RecordOutcome> {
        match existing.status {
            RevenueStatus::Pending | RevenueStatus::Failed => {
                let change = RevenueStatusChange::Paid { paid_at };
                if self
                    .store
                    .update_revenue_status(existing.id, existing.status, &change)
                    .await?
                {
                    info!(revenue_id = %existing.id, from = %existing.status, "Invoice settled as paid");
                    return Ok(RecordOutcome::StatusChanged(self.store.get_revenue(existing.id).await?));
                }
                Ok(RecordOutcome::AlreadyRecorded(self.store.get_revenue(existing.id).await?))
            }
            _ => {
                warn!(
                    revenue_id = %existing.id,
                    invoice_id = ?existing.invoice_id,
                    "Duplicate payment event ignored"
                );
                Ok(RecordOutcome::AlreadyRecorded(existing))
            }
        }
    }

    /// Records a failed invoice. Idempotent on the invoice id; never
    /// downgrades an invoice that was already paid.
    pub async fn record_payment_failure(&self, event: PaymentFailureEvent) -> ServiceResult<RecordOutcome> {
        check_money(event.amount, &event.currency)?;
        check_billing_period(event.billing_period_start, event.billing_period_end)?;
        let invoice_id = normalize_invoice(Some(&event.invoice_id))?
            .ok_or_else(|| invalid("A payment failure must carry an invoice id"))?;
        let now = Utc::now();

        if let Some(existing) = self.store.find_by_invoice(&invoice_id).await? {
            return self.fail_existing(existing, &event.reason, now).await;
        }

        let revenue = SubscriptionRevenue {
            id: Uuid::new_v4(),
            subscription_id: event.subscription_id,
            amount: event.amount,
            currency: event.currency.to_uppercase(),
            invoice_id: Some(invoice_id.clone()),
            payment_intent_id: None,
            payment_method: None,
            billing_period_start: event.billing_period_start,
            billing_period_end: event.billing_period_end,
            status: RevenueStatus::Failed,
            paid_at: None,
            failed_at: Some(now),
            failure_reason: Some(event.reason.clone()),
            refunded_at: None,
            refund_amount: None,
            refund_reason: None,
            created_at: now,
        };

        if self.store.insert_revenue(&revenue).await? {
            warn!(revenue_id = %revenue.id, invoice_id = %invoice_id, reason = %event.reason, "Payment failure recorded");
            return Ok(RecordOutcome::Created(revenue));
        }
        let existing = self.existing_invoice(Some(&invoice_id)).await?;
        self.fail_existing(existing, &event.reason, now).await
    }

    async fn fail_existing(
        &self,
        existing: SubscriptionRevenue,
        reason: &str,
        at: DateTime<Utc>,
    ) -> ServiceResult<RecordOutcome> {
        if existing.status == RevenueStatus::Pending {
            let change = RevenueStatusChange::Failed {
                reason: reason.to_string(),
                failed_at: at,
            };
            if self
                .store
                .update_revenue_status(existing.id, RevenueStatus::Pending, &change)
                .await?
            {
                return Ok(RecordOutcome::StatusChanged(self.store.get_revenue(existing.id).await?));
            }
        }
        debug!(revenue_id = %existing.id, status = %existing.status, "Payment failure already reflected");
        Ok(RecordOutcome::AlreadyRecorded(self.store.get_revenue(existing.id).await?))
    }

    pub async fn record_refund(
        &self,
        revenue_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> ServiceResult<RecordOutcome> {
        self.reverse(revenue_id, amount, reason, Reversal::Refund).await
    }

    pub async fn record_chargeback(
        &self,
        revenue_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> ServiceResult<RecordOutcome> {
        self.reverse(revenue_id, amount, reason, Reversal::Chargeback).await
    }

    async fn reverse(
        &self,
        revenue_id: Uuid,
        amount: Decimal,
        reason: &str,
        kind: Reversal,
    ) -> ServiceResult<RecordOutcome> {
        if amount <= Decimal::ZERO {
            return Err(invalid(format!("Reversal amount must be positive, got {}", amount)));
        }
        check_cents(amount)?;
        let target = kind.status();
        let revenue = self.store.get_revenue(revenue_id).await?;

        if revenue.status == RevenueStatus::Paid {
            if amount > revenue.amount {
                return Err(invalid(format!(
                    "Reversal of {} exceeds the original amount {}",
                    amount, revenue.amount
                )));
            }
            let now = Utc::now();
            let change = match kind {
                Reversal::Refund => RevenueStatusChange::Refunded {
                    amount,
                    reason: reason.to_string(),
                    refunded_at: now,
                },
                Reversal::Chargeback => RevenueStatusChange::ChargedBack {
                    amount,
                    reason: reason.to_string(),
                    charged_back_at: now,
                },
            };
            if self
                .store
                .update_revenue_status(revenue_id, RevenueStatus::Paid, &change)
                .await?
            {
                warn!(revenue_id = %revenue_id, %amount, status = %target, reason, "Revenue reversed");
                return Ok(RecordOutcome::StatusChanged(self.store.get_revenue(revenue_id).await?));
            }
            // A concurrent delivery got there first; judge against what it wrote.
            let current = self.store.get_revenue(revenue_id).await?;
            return self.reversal_redelivery(current, amount, target);
        }

        self.reversal_redelivery(revenue, amount, target)
    }

    fn reversal_redelivery(
        &self,
        current: SubscriptionRevenue,
        amount: Decimal,
        target: RevenueStatus,
    ) -> ServiceResult<RecordOutcome> {
        if current.status == target && current.refund_amount == Some(amount) {
            debug!(revenue_id = %current.id, "Duplicate reversal ignored");
            return Ok(RecordOutcome::AlreadyRecorded(current));
        }
        Err(ServiceError::InvalidTransition {
            entity: "revenue",
            id: current.id,
            from: current.status.to_string(),
            to: target.to_string(),
        })
    }

    async fn existing_invoice(&self, invoice_id: Option<&str>) -> ServiceResult<SubscriptionRevenue> {
        let invoice = invoice_id.ok_or_else(|| ServiceError::NotFound("Revenue row".to_string()))?;
        self.store
            .find_by_invoice(invoice)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Revenue for invoice {}", invoice)))
    }

    pub async fn revenue_by_invoice(&self, invoice_id: &str) -> ServiceResult<Option<SubscriptionRevenue>> {
        Ok(self.store.find_by_invoice(invoice_id).await?)
    }

    /// Sum of paid revenue with a payment time in `[start, end)`.
    pub async fn total_revenue(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> ServiceResult<Decimal> {
        check_range(start, end)?;
        Ok(self.store.total_paid(start, end).await?)
    }

    pub async fn monthly_revenue(&self, period: AccountingPeriod) -> ServiceResult<Decimal> {
        self.total_revenue(period.start(), period.end()).await
    }

    /// Contracted monthly recurring revenue of subscriptions active at `as_of`.
    pub async fn mrr(&self, as_of: DateTime<Utc>) -> ServiceResult<Decimal> {
        let active = self.subscriptions.active_subscriptions(as_of).await?;
        let total: Decimal = active.iter().map(|s| s.monthly_value()).sum();
        Ok(round_money(total))
    }

    pub async fn arr(&self, as_of: DateTime<Utc>) -> ServiceResult<Decimal> {
        Ok(self.mrr(as_of).await? * Decimal::from(12))
    }

    /// Contracted monthly value per plan name at `as_of`.
    pub async fn revenue_by_plan(&self, as_of: DateTime<Utc>) -> ServiceResult<BTreeMap<String, Decimal>> {
        let mut by_plan: BTreeMap<String, Decimal> = BTreeMap::new();
        for sub in self.subscriptions.active_subscriptions(as_of).await? {
            *by_plan.entry(sub.plan_name.clone()).or_default() += sub.monthly_value();
        }
        Ok(by_plan.into_iter().map(|(plan, v)| (plan, round_money(v))).collect())
    }

    pub async fn revenue_metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ServiceResult<RevenueMetrics> {
        check_range(start, end)?;
        let stats = self.store.revenue_stats(start, end).await?;
        let previous_start = start - (end - start);
        let previous = self.store.total_paid(previous_start, start).await?;

        let growth_rate = if previous > Decimal::ZERO {
            round_money((stats.paid_total - previous) / previous * Decimal::ONE_HUNDRED)
        } else {
            Decimal::ZERO
        };

        // Contracted values are taken at the last instant inside the window.
        let as_of = end - Duration::seconds(1);
        let mrr = self.mrr(as_of).await?;

        let metrics = RevenueMetrics {
            start,
            end,
            total_revenue: stats.paid_total,
            previous_period_revenue: previous,
            growth_rate,
            mrr,
            arr: mrr * Decimal::from(12),
            transaction_count: stats.paid_count,
            failed_count: stats.failed_count,
            refunded_count: stats.refunded_count,
            charged_back_count: stats.charged_back_count,
            average_transaction_value: average(stats.paid_total, stats.paid_count),
            revenue_by_plan: self.revenue_by_plan(as_of).await?,
        };
        info!(
            total = %metrics.total_revenue,
            mrr = %metrics.mrr,
            growth = %metrics.growth_rate,
            "Revenue metrics computed"
        );
        Ok(metrics)
    }

    /// Twelve entries, January first.
    pub async fn monthly_breakdown(&self, year: i32) -> ServiceResult<Vec<MonthlyRevenue>> {
        let mut months = Vec::with_capacity(12);
        for month in 1..=12 {
            let period = AccountingPeriod::new(month, year)?;
            let stats = self.store.revenue_stats(period.start(), period.end()).await?;
            months.push(MonthlyRevenue {
                period,
                total_revenue: stats.paid_total,
                transaction_count: stats.paid_count,
                average_transaction_value: average(stats.paid_total, stats.paid_count),
                failed_payments: stats.failed_count,
                mrr: self.mrr(period.end() - Duration::seconds(1)).await?,
            });
        }
        Ok(months)
    }
}

fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

fn average(total: Decimal, count: i64) -> Decimal {
    if count > 0 {
        round_money(total / Decimal::from(count))
    } else {
        Decimal::ZERO
    }
}

fn check_money(amount: Decimal, currency: &str) -> ServiceResult<()> {
    if amount < Decimal::ZERO {
        return Err(invalid(format!("Amount must not be negative, got {}", amount)));
    }
    check_cents(amount)?;
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(invalid(format!("Invalid currency code '{}'", currency)));
    }
    Ok(())
}

/// Amounts are stored with two decimal places; finer amounts would be
/// rounded by the database but kept exactly in memory.
fn check_cents(amount: Decimal) -> ServiceResult<()> {
    if amount.normalize().scale() > 2 {
        return Err(invalid(format!(
            "Amount {} has more than two decimal places",
            amount
        )));
    }
    Ok(())
}

fn check_billing_period(start: DateTime<Utc>, end: DateTime<Utc>) -> ServiceResult<()> {
    if end <= start {
        return Err(invalid("Billing period end must be after its start"));
    }
    Ok(())
}

fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> ServiceResult<()> {
    if end <= start {
        return Err(invalid("Range end must be after its start"));
    }
    Ok(())
}

fn normalize_invoice(invoice_id: Option<&str>) -> ServiceResult<Option<String>> {
    match invoice_id.map(str::trim) {
        None => Ok(None),
        Some("") => Err(invalid("Invoice id must not be blank")),
        Some(id) => Ok(Some(id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActiveSubscription, BillingInterval};
    use crate::memory::InMemoryStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ledger() -> (Arc<InMemoryStore>, RevenueLedger) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), RevenueLedger::new(store.clone(), store))
    }

    fn paid(invoice: Option<&str>, amount: Decimal, paid_at: DateTime<Utc>) -> RevenueEvent {
        RevenueEvent {
            subscription_id: Uuid::new_v4(),
            amount,
            currency: "eur".into(),
            invoice_id: invoice.map(str::to_string),
            payment_intent_id: None,
            payment_method: Some("card".into()),
            billing_period_start: paid_at,
            billing_period_end: paid_at + Duration::days(30),
            paid_at: Some(paid_at),
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn same_invoice_twice_leaves_one_row() {
        let (store, ledger) = ledger();
        let first = ledger.record_revenue(paid(Some("inv_123"), dec!(10), at(2025, 3, 5))).await.unwrap();
        let second = ledger.record_revenue(paid(Some("inv_123"), dec!(10), at(2025, 3, 5))).await.unwrap();

        assert!(matches!(first, RecordOutcome::Created(_)));
        assert!(matches!(second, RecordOutcome::AlreadyRecorded(_)));
        assert_eq!(store.revenue_count(), 1);

        let period = AccountingPeriod::new(3, 2025).unwrap();
        assert_eq!(ledger.monthly_revenue(period).await.unwrap(), dec!(10));
    }

    #[tokio::test]
    async fn sub_cent_amounts_are_rejected() {
        let (store, ledger) = ledger();
        let err = ledger
            .record_revenue(paid(Some("inv_frac"), dec!(10.005), at(2025, 3, 5)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
        assert_eq!(store.revenue_count(), 0);

        // Trailing zeros are not extra precision.
        let ok = ledger
            .record_revenue(paid(Some("inv_zeros"), dec!(10.500), at(2025, 3, 5)))
            .await
            .unwrap();
        let RecordOutcome::Created(revenue) = ok else {
            panic!("expected a new row");
        };

        let err = ledger
            .record_refund(revenue.id, dec!(1.234), "partial")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn concurrent_redeliveries_insert_once() {
        let (store, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.record_revenue(paid(Some("inv_race"), dec!(25), at(2025, 3, 5))).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.revenue_count(), 1);
    }

    #[tokio::test]
    async fn rows_without_invoice_are_not_deduplicated() {
        let (store, ledger) = ledger();
        ledger.record_revenue(paid(None, dec!(5), at(2025, 3, 5))).await.unwrap();
        ledger.record_revenue(paid(None, dec!(5), at(2025, 3, 5))).await.unwrap();
        assert_eq!(store.revenue_count(), 2);
    }

    #[tokio::test]
    async fn total_is_half_open_on_paid_time() {
        let (_, ledger) = ledger();
        let start = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        ledger.record_revenue(paid(Some("a"), dec!(10), start)).await.unwrap();
        ledger
            .record_revenue(paid(Some("b"), dec!(20), start + Duration::days(30)))
            .await
            .unwrap();
        ledger
            .record_revenue(paid(Some("c"), dec!(40), start - Duration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(
            ledger.total_revenue(start, start + Duration::days(30)).await.unwrap(),
            dec!(10)
        );
    }

    #[tokio::test]
    async fn failed_invoice_becomes_paid_on_later_success() {
        let (store, ledger) = ledger();
        let failure = PaymentFailureEvent {
            subscription_id: Uuid::new_v4(),
            amount: dec!(15),
            currency: "EUR".into(),
            invoice_id: "inv_9".into(),
            billing_period_start: at(2025, 5, 1),
            billing_period_end: at(2025, 6, 1),
            reason: "card_declined".into(),
        };
        assert!(matches!(
            ledger.record_payment_failure(failure.clone()).await.unwrap(),
            RecordOutcome::Created(_)
        ));
        assert!(matches!(
            ledger.record_payment_failure(failure).await.unwrap(),
            RecordOutcome::AlreadyRecorded(_)
        ));

        let outcome = ledger.record_revenue(paid(Some("inv_9"), dec!(15), at(2025, 5, 3))).await.unwrap();
        assert!(matches!(outcome, RecordOutcome::StatusChanged(_)));
        assert_eq!(outcome.revenue().status, RevenueStatus::Paid);
        assert_eq!(store.revenue_count(), 1);
    }

    #[tokio::test]
    async fn refund_is_bounded_and_redelivery_is_a_no_op() {
        let (_, ledger) = ledger();
        let row = ledger
            .record_revenue(paid(Some("inv_r"), dec!(30), at(2025, 3, 5)))
            .await
            .unwrap()
            .revenue()
            .clone();

        assert!(matches!(
            ledger.record_refund(row.id, dec!(30.01), "too much").await,
            Err(ServiceError::InvalidInput(_))
        ));

        let refunded = ledger.record_refund(row.id, dec!(12.50), "requested").await.unwrap();
        assert!(matches!(refunded, RecordOutcome::StatusChanged(_)));
        assert_eq!(refunded.revenue().refund_amount, Some(dec!(12.50)));

        assert!(matches!(
            ledger.record_refund(row.id, dec!(12.50), "requested").await.unwrap(),
            RecordOutcome::AlreadyRecorded(_)
        ));
        assert!(matches!(
            ledger.record_chargeback(row.id, dec!(30), "fraud").await,
            Err(ServiceError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn refunding_a_never_paid_row_is_an_invalid_transition() {
        let (_, ledger) = ledger();
        let failed = ledger
            .record_payment_failure(PaymentFailureEvent {
                subscription_id: Uuid::new_v4(),
                amount: dec!(15),
                currency: "EUR".into(),
                invoice_id: "inv_f".into(),
                billing_period_start: at(2025, 5, 1),
                billing_period_end: at(2025, 6, 1),
                reason: "insufficient_funds".into(),
            })
            .await
            .unwrap();

        assert!(matches!(
            ledger.record_refund(failed.revenue().id, dec!(1), "n/a").await,
            Err(ServiceError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn mrr_uses_contracted_prices_not_payments() {
        let (store, ledger) = ledger();
        let from = at(2025, 1, 1);
        store.add_subscription(
            ActiveSubscription {
                subscription_id: Uuid::new_v4(),
                plan_name: "Pro".into(),
                billing_interval: BillingInterval::Yearly,
                price_monthly: dec!(12),
                price_yearly: Some(dec!(100)),
            },
            from,
            None,
        );
        store.add_subscription(
            ActiveSubscription {
                subscription_id: Uuid::new_v4(),
                plan_name: "Basic".into(),
                billing_interval: BillingInterval::Monthly,
                price_monthly: dec!(9.99),
                price_yearly: None,
            },
            from,
            None,
        );
        // A large one-off payment does not move MRR.
        ledger.record_revenue(paid(Some("big"), dec!(5000), at(2025, 3, 5))).await.unwrap();

        let as_of = at(2025, 3, 10);
        assert_eq!(ledger.mrr(as_of).await.unwrap(), dec!(18.32));
        assert_eq!(ledger.arr(as_of).await.unwrap(), dec!(219.84));
        let by_plan = ledger.revenue_by_plan(as_of).await.unwrap();
        assert_eq!(by_plan.get("Pro"), Some(&dec!(8.33)));
    }

    #[tokio::test]
    async fn metrics_compare_against_previous_window() {
        let (_, ledger) = ledger();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let end = start + Duration::days(10);
        ledger.record_revenue(paid(Some("prev"), dec!(100), start - Duration::days(5))).await.unwrap();
        ledger.record_revenue(paid(Some("cur1"), dec!(100), start + Duration::days(1))).await.unwrap();
        ledger.record_revenue(paid(Some("cur2"), dec!(50), start + Duration::days(2))).await.unwrap();

        let metrics = ledger.revenue_metrics(start, end).await.unwrap();
        assert_eq!(metrics.total_revenue, dec!(150));
        assert_eq!(metrics.previous_period_revenue, dec!(100));
        assert_eq!(metrics.growth_rate, dec!(50));
        assert_eq!(metrics.transaction_count, 2);
        assert_eq!(metrics.average_transaction_value, dec!(75));
    }

    #[tokio::test]
    async fn yearly_breakdown_has_twelve_months() {
        let (_, ledger) = ledger();
        ledger.record_revenue(paid(Some("m2"), dec!(20), at(2025, 2, 14))).await.unwrap();
        let months = ledger.monthly_breakdown(2025).await.unwrap();
        assert_eq!(months.len(), 12);
        assert_eq!(months[1].total_revenue, dec!(20));
        assert_eq!(months[0].total_revenue, Decimal::ZERO);
    }
}
