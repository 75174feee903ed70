//! crates/revshare_core/src/memory.rs
//!
//! In-memory implementations of every storage and directory port, for tests
//! and local development. Each compare-and-set runs under a single write lock,
//! so the uniqueness and transition guarantees match the relational adapter.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{
    AccountingPeriod, ActiveSubscription, Engagement, EngagementMetadata, InstructorConnectAccount,
    InstructorPayout, PayoutCalculation, PayoutStatus, RevenueStatus, SubscriptionRevenue,
};
use crate::ports::{
    ConnectAccountDirectory, CourseCatalog, EngagementQuery, EngagementStore, PayoutStatusChange,
    PayoutStore, PortError, PortResult, QualifyingMinutes, RevenueStats, RevenueStatusChange,
    RevenueStore, SubscriptionDirectory,
};

#[derive(Debug, Clone)]
struct SubscriptionEntry {
    subscription: ActiveSubscription,
    active_from: DateTime<Utc>,
    active_until: Option<DateTime<Utc>>,
}

/// One process-local store backing all ports.
#[derive(Default)]
pub struct InMemoryStore {
    engagements: RwLock<HashMap<Uuid, Engagement>>,
    revenues: RwLock<HashMap<Uuid, SubscriptionRevenue>>,
    payouts: RwLock<HashMap<Uuid, InstructorPayout>>,
    course_owners: RwLock<HashMap<Uuid, Uuid>>,
    accounts: RwLock<HashMap<Uuid, InstructorConnectAccount>>,
    subscriptions: RwLock<Vec<SubscriptionEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_course(&self, course_id: Uuid, instructor_id: Uuid) {
        self.course_owners.write().insert(course_id, instructor_id);
    }

    pub fn upsert_connect_account(&self, account: InstructorConnectAccount) {
        self.accounts.write().insert(account.instructor_id, account);
    }

    /// Registers a subscription active from `active_from` until `active_until` (exclusive).
    pub fn add_subscription(
        &self,
        subscription: ActiveSubscription,
        active_from: DateTime<Utc>,
        active_until: Option<DateTime<Utc>>,
    ) {
        self.subscriptions.write().push(SubscriptionEntry {
            subscription,
            active_from,
            active_until,
        });
    }

    pub fn revenue_count(&self) -> usize {
        self.revenues.read().len()
    }
}

#[async_trait]
impl EngagementStore for InMemoryStore {
    async fn insert_engagement(&self, engagement: &Engagement) -> PortResult<()> {
        let mut rows = self.engagements.write();
        if rows.contains_key(&engagement.id) {
            return Err(PortError::Unexpected(format!(
                "Engagement {} already exists",
                engagement.id
            )));
        }
        rows.insert(engagement.id, engagement.clone());
        Ok(())
    }

    async fn get_engagement(&self, id: Uuid) -> PortResult<Engagement> {
        self.engagements
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Engagement {}", id)))
    }

    async fn fingerprint_seen(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        started_before: DateTime<Utc>,
    ) -> PortResult<bool> {
        Ok(self.engagements.read().values().any(|e| {
            e.user_id == user_id
                && e.started_at < started_before
                && !e.fraud_flagged
                && e.metadata.device_fingerprint.as_deref() == Some(fingerprint)
        }))
    }

    async fn complete_session(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        duration_minutes: u32,
        metadata: &EngagementMetadata,
    ) -> PortResult<bool> {
        let mut rows = self.engagements.write();
        match rows.get_mut(&id) {
            Some(e) if e.completed_at.is_none() && e.validation_score.is_none() => {
                e.completed_at = Some(completed_at);
                e.duration_minutes = duration_minutes;
                e.metadata = metadata.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PortError::NotFound(format!("Engagement {}", id))),
        }
    }

    async fn pending_validation(
        &self,
        completed_after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> PortResult<Vec<Engagement>> {
        let mut pending: Vec<Engagement> = self
            .engagements
            .read()
            .values()
            .filter(|e| e.validation_score.is_none())
            .filter(|e| match (e.completed_at, completed_after) {
                (Some(done), Some(after)) => done > after,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .cloned()
            .collect();
        pending.sort_by_key(|e| (e.completed_at, e.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn apply_validation(
        &self,
        id: Uuid,
        score: Decimal,
        counts_for_payout: bool,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut rows = self.engagements.write();
        match rows.get_mut(&id) {
            Some(e) if e.validation_score.is_none() => {
                e.validation_score = Some(score);
                e.counts_for_payout = counts_for_payout && !e.fraud_flagged;
                e.validated_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PortError::NotFound(format!("Engagement {}", id))),
        }
    }

    async fn override_validation(
        &self,
        id: Uuid,
        score: Decimal,
        counts_for_payout: bool,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut rows = self.engagements.write();
        match rows.get_mut(&id) {
            Some(e) if !e.fraud_flagged => {
                e.validation_score = Some(score);
                e.counts_for_payout = counts_for_payout;
                e.validated_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PortError::NotFound(format!("Engagement {}", id))),
        }
    }

    async fn flag_fraudulent(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> PortResult<bool> {
        let mut rows = self.engagements.write();
        match rows.get_mut(&id) {
            Some(e) if !e.fraud_flagged => {
                e.fraud_flagged = true;
                e.fraud_reason = Some(reason.to_string());
                e.fraud_flagged_at = Some(at);
                e.validation_score = Some(Decimal::ZERO);
                e.counts_for_payout = false;
                e.validated_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PortError::NotFound(format!("Engagement {}", id))),
        }
    }

    async fn list_engagements(&self, query: &EngagementQuery) -> PortResult<Vec<Engagement>> {
        let mut rows: Vec<Engagement> = self
            .engagements
            .read()
            .values()
            .filter(|e| query.user_id.map_or(true, |u| e.user_id == u))
            .filter(|e| query.course_id.map_or(true, |c| e.course_id == c))
            .filter(|e| e.started_at >= query.started_from && e.started_at < query.started_before)
            .cloned()
            .collect();
        rows.sort_by_key(|e| (e.started_at, e.id));
        Ok(rows)
    }

    async fn qualifying_minutes(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PortResult<Vec<QualifyingMinutes>> {
        let mut grouped: BTreeMap<(Uuid, Uuid), (i64, i64)> = BTreeMap::new();
        for e in self.engagements.read().values() {
            if e.counts_for_payout && !e.fraud_flagged && e.started_at >= start && e.started_at < end {
                let entry = grouped.entry((e.course_id, e.user_id)).or_default();
                entry.0 += i64::from(e.duration_minutes);
                entry.1 += 1;
            }
        }
        Ok(grouped
            .into_iter()
            .map(|((course_id, user_id), (minutes, engagements))| QualifyingMinutes {
                course_id,
                user_id,
                minutes,
                engagements,
            })
            .collect())
    }
}

#[async_trait]
impl RevenueStore for InMemoryStore {
    async fn insert_revenue(&self, revenue: &SubscriptionRevenue) -> PortResult<bool> {
        let mut rows = self.revenues.write();
        if let Some(invoice) = revenue.invoice_id.as_deref() {
            if rows.values().any(|r| r.invoice_id.as_deref() == Some(invoice)) {
                return Ok(false);
            }
        }
        if rows.contains_key(&revenue.id) {
            return Ok(false);
        }
        rows.insert(revenue.id, revenue.clone());
        Ok(true)
    }

    async fn get_revenue(&self, id: Uuid) -> PortResult<SubscriptionRevenue> {
        self.revenues
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Revenue {}", id)))
    }

    async fn find_by_invoice(&self, invoice_id: &str) -> PortResult<Option<SubscriptionRevenue>> {
        Ok(self
            .revenues
            .read()
            .values()
            .find(|r| r.invoice_id.as_deref() == Some(invoice_id))
            .cloned())
    }

    async fn update_revenue_status(
        &self,
        id: Uuid,
        expected: RevenueStatus,
        change: &RevenueStatusChange,
    ) -> PortResult<bool> {
        let mut rows = self.revenues.write();
        let row = match rows.get_mut(&id) {
            Some(row) if row.status == expected => row,
            Some(_) => return Ok(false),
            None => return Err(PortError::NotFound(format!("Revenue {}", id))),
        };
        row.status = change.target();
        match change {
            RevenueStatusChange::Paid { paid_at } => {
                row.paid_at = Some(*paid_at);
                row.failure_reason = None;
            }
            RevenueStatusChange::Failed { reason, failed_at } => {
                row.failed_at = Some(*failed_at);
                row.failure_reason = Some(reason.clone());
            }
            RevenueStatusChange::Refunded { amount, reason, refunded_at } => {
                row.refunded_at = Some(*refunded_at);
                row.refund_amount = Some(*amount);
                row.refund_reason = Some(reason.clone());
            }
            RevenueStatusChange::ChargedBack { amount, reason, charged_back_at } => {
                row.refunded_at = Some(*charged_back_at);
                row.refund_amount = Some(*amount);
                row.refund_reason = Some(reason.clone());
            }
        }
        Ok(true)
    }

    async fn total_paid(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PortResult<Decimal> {
        Ok(self
            .revenues
            .read()
            .values()
            .filter(|r| r.status == RevenueStatus::Paid)
            .filter(|r| r.paid_at.map_or(false, |at| at >= start && at < end))
            .map(|r| r.amount)
            .sum())
    }

    async fn revenue_stats(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PortResult<RevenueStats> {
        let in_range = |at: Option<DateTime<Utc>>| at.map_or(false, |at| at >= start && at < end);
        let mut stats = RevenueStats::default();
        for r in self.revenues.read().values() {
            match r.status {
                RevenueStatus::Paid if in_range(r.paid_at) => {
                    stats.paid_total += r.amount;
                    stats.paid_count += 1;
                }
                RevenueStatus::Failed if in_range(r.failed_at) => stats.failed_count += 1,
                RevenueStatus::Refunded if in_range(r.refunded_at) => stats.refunded_count += 1,
                RevenueStatus::ChargedBack if in_range(r.refunded_at) => stats.charged_back_count += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl PayoutStore for InMemoryStore {
    async fn insert_payout(&self, payout: &InstructorPayout) -> PortResult<bool> {
        let mut rows = self.payouts.write();
        let taken = rows
            .values()
            .any(|p| p.instructor_id == payout.instructor_id && p.period == payout.period);
        if taken || rows.contains_key(&payout.id) {
            return Ok(false);
        }
        rows.insert(payout.id, payout.clone());
        Ok(true)
    }

    async fn get_payout(&self, id: Uuid) -> PortResult<InstructorPayout> {
        self.payouts
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Payout {}", id)))
    }

    async fn find_payout(
        &self,
        instructor_id: Uuid,
        period: AccountingPeriod,
    ) -> PortResult<Option<InstructorPayout>> {
        Ok(self
            .payouts
            .read()
            .values()
            .find(|p| p.instructor_id == instructor_id && p.period == period)
            .cloned())
    }

    async fn payouts_for_period(&self, period: AccountingPeriod) -> PortResult<Vec<InstructorPayout>> {
        let mut rows: Vec<InstructorPayout> = self
            .payouts
            .read()
            .values()
            .filter(|p| p.period == period)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.instructor_id);
        Ok(rows)
    }

    async fn payouts_for_instructor(
        &self,
        instructor_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> PortResult<Vec<InstructorPayout>> {
        let mut rows: Vec<InstructorPayout> = self
            .payouts
            .read()
            .values()
            .filter(|p| p.instructor_id == instructor_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.period.cmp(&a.period));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn payouts_with_status(
        &self,
        status: PayoutStatus,
        limit: usize,
    ) -> PortResult<Vec<InstructorPayout>> {
        let mut rows: Vec<InstructorPayout> = self
            .payouts
            .read()
            .values()
            .filter(|p| p.status == status)
            .filter(|p| status != PayoutStatus::Processing || p.transfer_started_at.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(|p| (p.created_at, p.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn update_payout_status(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        change: &PayoutStatusChange,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut rows = self.payouts.write();
        let row = match rows.get_mut(&id) {
            Some(row) if row.status == expected => row,
            Some(_) => return Ok(false),
            None => return Err(PortError::NotFound(format!("Payout {}", id))),
        };
        row.status = change.target();
        row.updated_at = at;
        match change {
            PayoutStatusChange::Processing => {
                row.transfer_started_at = None;
                row.error_message = None;
            }
            PayoutStatusChange::Paid { transfer_id } => {
                row.transfer_id = transfer_id.clone();
                row.paid_at = Some(at);
                row.error_message = None;
            }
            PayoutStatusChange::Failed { reason } => {
                row.error_message = Some(reason.clone());
                row.failed_at = Some(at);
            }
            PayoutStatusChange::Pending { next_attempt } => {
                row.error_message = None;
                row.transfer_started_at = None;
                if *next_attempt {
                    row.transfer_attempt += 1;
                }
            }
        }
        Ok(true)
    }

    async fn claim_transfer(&self, id: Uuid, at: DateTime<Utc>) -> PortResult<bool> {
        let mut rows = self.payouts.write();
        match rows.get_mut(&id) {
            Some(row) if row.status == PayoutStatus::Processing && row.transfer_started_at.is_none() => {
                row.transfer_started_at = Some(at);
                row.updated_at = at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PortError::NotFound(format!("Payout {}", id))),
        }
    }

    async fn replace_calculation(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        calculation: &PayoutCalculation,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut rows = self.payouts.write();
        match rows.get_mut(&id) {
            Some(row) if row.status == expected => {
                row.calculation = calculation.clone();
                row.status = PayoutStatus::Pending;
                row.error_message = None;
                row.transfer_started_at = None;
                row.updated_at = at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PortError::NotFound(format!("Payout {}", id))),
        }
    }

    async fn total_paid_to(&self, instructor_id: Uuid) -> PortResult<Decimal> {
        Ok(self
            .payouts
            .read()
            .values()
            .filter(|p| p.instructor_id == instructor_id && p.status == PayoutStatus::Paid)
            .map(|p| p.amount())
            .sum())
    }
}

#[async_trait]
impl CourseCatalog for InMemoryStore {
    async fn course_owners(&self, course_ids: &[Uuid]) -> PortResult<HashMap<Uuid, Uuid>> {
        let owners = self.course_owners.read();
        Ok(course_ids
            .iter()
            .filter_map(|c| owners.get(c).map(|i| (*c, *i)))
            .collect())
    }
}

#[async_trait]
impl ConnectAccountDirectory for InMemoryStore {
    async fn connect_account(&self, instructor_id: Uuid) -> PortResult<Option<InstructorConnectAccount>> {
        Ok(self.accounts.read().get(&instructor_id).cloned())
    }

    async fn record_payout(
        &self,
        instructor_id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> PortResult<()> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(&instructor_id)
            .ok_or_else(|| PortError::NotFound(format!("Connect account for {}", instructor_id)))?;
        account.total_paid_out += amount;
        account.last_payout_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionDirectory for InMemoryStore {
    async fn active_subscriptions(&self, as_of: DateTime<Utc>) -> PortResult<Vec<ActiveSubscription>> {
        Ok(self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.active_from <= as_of && s.active_until.map_or(true, |until| as_of < until))
            .map(|s| s.subscription.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EngagementType, PayoutBreakdown};
    use chrono::TimeZone;

    fn engagement(user_id: Uuid, fingerprint: Option<&str>) -> Engagement {
        let now = Utc::now();
        Engagement {
            id: Uuid::new_v4(),
            user_id,
            course_id: Uuid::new_v4(),
            lesson_id: None,
            engagement_type: EngagementType::VideoWatch,
            duration_minutes: 10,
            started_at: now,
            completed_at: None,
            validation_score: None,
            counts_for_payout: false,
            fraud_flagged: false,
            fraud_reason: None,
            fraud_flagged_at: None,
            metadata: EngagementMetadata {
                device_fingerprint: fingerprint.map(str::to_string),
                ..Default::default()
            },
            validated_at: None,
            created_at: now,
        }
    }

    fn payout(instructor_id: Uuid, period: AccountingPeriod) -> InstructorPayout {
        let now = Utc::now();
        InstructorPayout {
            id: Uuid::new_v4(),
            instructor_id,
            period,
            calculation: PayoutCalculation {
                instructor_minutes: 1,
                platform_minutes: 1,
                platform_revenue: Decimal::ONE,
                engagement_percentage: Decimal::ONE,
                commission_rate: Decimal::ZERO,
                payout_amount: Decimal::ONE,
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
        }
    }

    #[tokio::test]
    async fn fingerprint_lookup_only_sees_earlier_unflagged_sessions() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let first = engagement(user, Some("fp-1"));
        store.insert_engagement(&first).await.unwrap();
        let after = first.started_at + chrono::Duration::seconds(1);

        assert!(!store.fingerprint_seen(user, "fp-1", first.started_at).await.unwrap());
        assert!(store.fingerprint_seen(user, "fp-1", after).await.unwrap());
        assert!(!store.fingerprint_seen(Uuid::new_v4(), "fp-1", after).await.unwrap());

        assert!(store.flag_fraudulent(first.id, "shared account", Utc::now()).await.unwrap());
        assert!(!store.fingerprint_seen(user, "fp-1", after).await.unwrap());
    }

    #[tokio::test]
    async fn second_payout_for_same_instructor_and_period_is_refused() {
        let store = InMemoryStore::new();
        let instructor = Uuid::new_v4();
        let period = AccountingPeriod::new(3, 2025).unwrap();

        assert!(store.insert_payout(&payout(instructor, period)).await.unwrap());
        assert!(!store.insert_payout(&payout(instructor, period)).await.unwrap());
        assert_eq!(store.payouts_for_period(period).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transfer_slot_can_only_be_claimed_once() {
        let store = InMemoryStore::new();
        let p = payout(Uuid::new_v4(), AccountingPeriod::new(3, 2025).unwrap());
        store.insert_payout(&p).await.unwrap();
        let now = Utc::now();

        assert!(!store.claim_transfer(p.id, now).await.unwrap());
        store
            .update_payout_status(p.id, PayoutStatus::Pending, &PayoutStatusChange::Processing, now)
            .await
            .unwrap();
        assert!(store.claim_transfer(p.id, now).await.unwrap());
        assert!(!store.claim_transfer(p.id, now).await.unwrap());
        assert!(store
            .payouts_with_status(PayoutStatus::Processing, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn subscriptions_are_active_in_half_open_window() {
        let store = InMemoryStore::new();
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        store.add_subscription(
            ActiveSubscription {
                subscription_id: Uuid::new_v4(),
                plan_name: "Basic".into(),
                billing_interval: crate::domain::BillingInterval::Monthly,
                price_monthly: Decimal::from(10),
                price_yearly: None,
            },
            from,
            Some(until),
        );

        assert_eq!(store.active_subscriptions(from).await.unwrap().len(), 1);
        assert!(store.active_subscriptions(until).await.unwrap().is_empty());
    }
}
