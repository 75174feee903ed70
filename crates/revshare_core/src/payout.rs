//! crates/revshare_core/src/payout.rs
//!
//! The Payout Calculator: turns one accounting period's paid revenue and
//! validated engagement into one payout row per instructor, plus the read
//! models admins and instructors see.
//!
//! Platform totals are recomputed from the stores on every run; nothing here
//! keeps a running counter.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    AccountingPeriod, CourseEngagementDetail, InstructorPayout, PayoutBreakdown, PayoutCalculation,
    PayoutStatus, PayoutTransition,
};
use crate::engagement::{attribute_to_instructors, InstructorAttribution};
use crate::error::{invalid, ServiceError, ServiceResult};
use crate::ports::{CourseCatalog, EngagementStore, PayoutStore, RevenueStore};

const CENT: Decimal = Decimal::from_parts(1, 0, 0, false, 2);
const MONEY_SCALE: u32 = 2;
const PERCENTAGE_SCALE: u32 = 6;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct PayoutConfig {
    /// Fraction of platform revenue shared among instructors.
    pub instructor_share_rate: Decimal,
    pub currency: String,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            instructor_share_rate: Decimal::new(80, 2),
            currency: "EUR".to_string(),
        }
    }
}

impl PayoutConfig {
    pub fn commission_rate(&self) -> Decimal {
        Decimal::ONE - self.instructor_share_rate
    }
}

/// Splits `revenue × share_rate` across instructors in proportion to their
/// minutes. Each share is rounded half away from zero to cents; if that
/// pushes the sum above the pool (rounded down to cents), single cents are
/// taken back from the shares that gained most from rounding, lowest
/// instructor id first on ties.
pub fn allocate(
    revenue: Decimal,
    share_rate: Decimal,
    platform_minutes: i64,
    minutes: &BTreeMap<Uuid, i64>,
) -> BTreeMap<Uuid, Decimal> {
    if platform_minutes <= 0 {
        return minutes.keys().map(|id| (*id, Decimal::ZERO)).collect();
    }
    let pool = revenue * share_rate;
    let cap = pool.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::ToZero);
    let platform = Decimal::from(platform_minutes);

    let mut shares: Vec<(Uuid, Decimal, Decimal)> = minutes
        .iter()
        .map(|(id, m)| {
            let exact = pool * Decimal::from(*m) / platform;
            let rounded = exact.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
            (*id, exact, rounded)
        })
        .collect();

    let mut total: Decimal = shares.iter().map(|(_, _, r)| *r).sum();
    while total > cap {
        let candidate = shares
            .iter_mut()
            .filter(|(_, _, rounded)| *rounded >= CENT)
            .max_by(|a, b| (a.2 - a.1).cmp(&(b.2 - b.1)).then_with(|| b.0.cmp(&a.0)));
        match candidate {
            Some(share) => {
                share.2 -= CENT;
                total -= CENT;
            }
            None => break,
        }
    }

    shares.into_iter().map(|(id, _, rounded)| (id, rounded)).collect()
}

//=========================================================================================
// Read models
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutPeriodSummary {
    pub period: AccountingPeriod,
    pub total_revenue: Decimal,
    pub platform_commission: Decimal,
    pub total_instructor_payouts: Decimal,
    pub total_platform_minutes: i64,
    pub total_instructors: u32,
    pub payouts_pending: u32,
    pub payouts_processing: u32,
    pub payouts_paid: u32,
    pub payouts_failed: u32,
}

/// A payout as its instructor sees it: no platform-wide figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructorPayoutEntry {
    pub payout_id: Uuid,
    pub period: AccountingPeriod,
    pub validated_minutes: i64,
    pub payout_amount: Decimal,
    pub currency: String,
    pub status: PayoutStatus,
    pub transfer_id: Option<String>,
    pub error_message: Option<String>,
    pub paid_at: Option<chrono::DateTime<Utc>>,
    pub unique_students: u32,
    pub courses: Vec<CourseEngagementDetail>,
}

impl From<InstructorPayout> for InstructorPayoutEntry {
    fn from(p: InstructorPayout) -> Self {
        Self {
            payout_id: p.id,
            period: p.period,
            validated_minutes: p.calculation.instructor_minutes,
            payout_amount: p.calculation.payout_amount,
            currency: p.currency,
            status: p.status,
            transfer_id: p.transfer_id,
            error_message: p.error_message,
            paid_at: p.paid_at,
            unique_students: p.calculation.breakdown.unique_students,
            courses: p.calculation.breakdown.courses,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutStatement {
    pub instructor_id: Uuid,
    pub page: usize,
    pub page_size: usize,
    pub payouts: Vec<InstructorPayoutEntry>,
    pub total_earned: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructorEarnings {
    pub instructor_id: Uuid,
    pub payout_amount: Decimal,
    pub engagement_minutes: i64,
    pub engagement_percentage: Decimal,
    pub unique_students: u32,
    pub courses_with_engagement: u32,
}

//=========================================================================================
// Service
//=========================================================================================

struct PeriodSnapshot {
    platform_revenue: Decimal,
    platform_minutes: i64,
    attributions: BTreeMap<Uuid, InstructorAttribution>,
}

pub struct PayoutCalculator {
    payouts: Arc<dyn PayoutStore>,
    engagements: Arc<dyn EngagementStore>,
    revenue: Arc<dyn RevenueStore>,
    catalog: Arc<dyn CourseCatalog>,
    config: PayoutConfig,
}

impl PayoutCalculator {
    pub fn new(
        payouts: Arc<dyn PayoutStore>,
        engagements: Arc<dyn EngagementStore>,
        revenue: Arc<dyn RevenueStore>,
        catalog: Arc<dyn CourseCatalog>,
        config: PayoutConfig,
    ) -> Self {
        Self {
            payouts,
            engagements,
            revenue,
            catalog,
            config,
        }
    }

    async fn snapshot(&self, period: AccountingPeriod) -> ServiceResult<PeriodSnapshot> {
        let (start, end) = (period.start(), period.end());
        let platform_revenue = self.revenue.total_paid(start, end).await?;
        let rows = self.engagements.qualifying_minutes(start, end).await?;
        let platform_minutes = rows.iter().map(|r| r.minutes).sum();

        let course_ids: Vec<Uuid> = rows
            .iter()
            .map(|r| r.course_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let owners = self.catalog.course_owners(&course_ids).await?;
        let mut attributions = attribute_to_instructors(&rows, &owners);
        attributions.retain(|_, a| a.minutes > 0);

        Ok(PeriodSnapshot {
            platform_revenue,
            platform_minutes,
            attributions,
        })
    }

    fn calculations(&self, snapshot: &PeriodSnapshot) -> BTreeMap<Uuid, PayoutCalculation> {
        let minutes: BTreeMap<Uuid, i64> = snapshot
            .attributions
            .iter()
            .map(|(id, a)| (*id, a.minutes))
            .collect();
        let amounts = allocate(
            snapshot.platform_revenue,
            self.config.instructor_share_rate,
            snapshot.platform_minutes,
            &minutes,
        );

        snapshot
            .attributions
            .iter()
            .map(|(id, attribution)| {
                let calc = PayoutCalculation {
                    instructor_minutes: attribution.minutes,
                    platform_minutes: snapshot.platform_minutes,
                    platform_revenue: snapshot.platform_revenue,
                    engagement_percentage: percentage(attribution.minutes, snapshot.platform_minutes),
                    commission_rate: self.config.commission_rate(),
                    payout_amount: amounts.get(id).copied().unwrap_or(Decimal::ZERO),
                    breakdown: attribution.breakdown.clone(),
                };
                (*id, calc)
            })
            .collect()
    }

    /// Creates the period's missing payout rows and returns every row of the
    /// period. Existing rows are left untouched; use `recalculate_payout` to
    /// change them.
    pub async fn calculate_all_payouts_for_period(
        &self,
        month: u32,
        year: i32,
    ) -> ServiceResult<Vec<InstructorPayout>> {
        let period = AccountingPeriod::new(month, year)?;
        let snapshot = self.snapshot(period).await?;

        if snapshot.platform_minutes == 0 {
            info!(%period, "No qualifying engagement in period; nothing to allocate");
            return Ok(self.payouts.payouts_for_period(period).await?);
        }

        info!(
            %period,
            revenue = %snapshot.platform_revenue,
            platform_minutes = snapshot.platform_minutes,
            instructors = snapshot.attributions.len(),
            "Calculating payouts"
        );

        let mut created = 0;
        for (instructor_id, calculation) in self.calculations(&snapshot) {
            if self.payouts.find_payout(instructor_id, period).await?.is_some() {
                debug!(%instructor_id, %period, "Payout already exists; skipped");
                continue;
            }
            let now = Utc::now();
            let payout = InstructorPayout {
                id: Uuid::new_v4(),
                instructor_id,
                period,
                calculation,
                currency: self.config.currency.clone(),
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
            if self.payouts.insert_payout(&payout).await? {
                created += 1;
                debug!(payout_id = %payout.id, %instructor_id, amount = %payout.amount(), "Payout created");
            } else {
                debug!(%instructor_id, %period, "Payout created concurrently; skipped");
            }
        }

        let rows = self.payouts.payouts_for_period(period).await?;
        info!(%period, created, total = rows.len(), "Payout calculation finished");
        Ok(rows)
    }

    /// Recomputes a pending or failed payout from the current period data
    /// and puts it back to pending.
    pub async fn recalculate_payout(&self, payout_id: Uuid) -> ServiceResult<InstructorPayout> {
        let payout = self.payouts.get_payout(payout_id).await?;
        PayoutTransition::Recalculate.check(payout_id, payout.status)?;

        let snapshot = self.snapshot(payout.period).await?;
        let calculation = self
            .calculations(&snapshot)
            .remove(&payout.instructor_id)
            .unwrap_or_else(|| PayoutCalculation {
                instructor_minutes: 0,
                platform_minutes: snapshot.platform_minutes,
                platform_revenue: snapshot.platform_revenue,
                engagement_percentage: Decimal::ZERO,
                commission_rate: self.config.commission_rate(),
                payout_amount: Decimal::ZERO,
                breakdown: PayoutBreakdown::default(),
            });

        if !self
            .payouts
            .replace_calculation(payout_id, payout.status, &calculation, Utc::now())
            .await?
        {
            let current = self.payouts.get_payout(payout_id).await?;
            return Err(ServiceError::InvalidTransition {
                entity: "payout",
                id: payout_id,
                from: current.status.to_string(),
                to: PayoutStatus::Pending.to_string(),
            });
        }

        warn!(
            %payout_id,
            previous_amount = %payout.amount(),
            new_amount = %calculation.payout_amount,
            previous_minutes = payout.calculation.instructor_minutes,
            new_minutes = calculation.instructor_minutes,
            "Payout recalculated"
        );
        Ok(self.payouts.get_payout(payout_id).await?)
    }

    pub async fn get_payout(&self, payout_id: Uuid) -> ServiceResult<InstructorPayout> {
        Ok(self.payouts.get_payout(payout_id).await?)
    }

    pub async fn get_payout_summary(&self, month: u32, year: i32) -> ServiceResult<PayoutPeriodSummary> {
        let period = AccountingPeriod::new(month, year)?;
        let payouts = self.payouts.payouts_for_period(period).await?;
        let total_revenue = self.revenue.total_paid(period.start(), period.end()).await?;
        let total_platform_minutes = self
            .engagements
            .qualifying_minutes(period.start(), period.end())
            .await?
            .iter()
            .map(|r| r.minutes)
            .sum();

        let count = |status: PayoutStatus| payouts.iter().filter(|p| p.status == status).count() as u32;
        Ok(PayoutPeriodSummary {
            period,
            total_revenue,
            platform_commission: (total_revenue * self.config.commission_rate())
                .round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero),
            total_instructor_payouts: payouts.iter().map(|p| p.amount()).sum(),
            total_platform_minutes,
            total_instructors: payouts
                .iter()
                .map(|p| p.instructor_id)
                .collect::<BTreeSet<_>>()
                .len() as u32,
            payouts_pending: count(PayoutStatus::Pending),
            payouts_processing: count(PayoutStatus::Processing),
            payouts_paid: count(PayoutStatus::Paid),
            payouts_failed: count(PayoutStatus::Failed),
        })
    }

    /// One page of an instructor's payouts, newest period first. `page` starts at 1.
    pub async fn get_instructor_payout_history(
        &self,
        instructor_id: Uuid,
        page: usize,
        page_size: usize,
    ) -> ServiceResult<PayoutStatement> {
        if page == 0 {
            return Err(invalid("Page numbers start at 1"));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(invalid(format!("Page size must be between 1 and {}", MAX_PAGE_SIZE)));
        }
        let rows = self
            .payouts
            .payouts_for_instructor(instructor_id, (page - 1) * page_size, page_size)
            .await?;
        Ok(PayoutStatement {
            instructor_id,
            page,
            page_size,
            payouts: rows.into_iter().map(InstructorPayoutEntry::from).collect(),
            total_earned: self.payouts.total_paid_to(instructor_id).await?,
        })
    }

    /// Sum of this instructor's paid payouts.
    pub async fn get_instructor_total_earned(&self, instructor_id: Uuid) -> ServiceResult<Decimal> {
        Ok(self.payouts.total_paid_to(instructor_id).await?)
    }

    pub async fn top_earning_instructors(
        &self,
        month: u32,
        year: i32,
        limit: usize,
    ) -> ServiceResult<Vec<InstructorEarnings>> {
        let period = AccountingPeriod::new(month, year)?;
        let mut payouts = self.payouts.payouts_for_period(period).await?;
        payouts.sort_by(|a, b| {
            b.amount()
                .cmp(&a.amount())
                .then_with(|| a.instructor_id.cmp(&b.instructor_id))
        });
        Ok(payouts
            .into_iter()
            .take(limit)
            .map(|p| InstructorEarnings {
                instructor_id: p.instructor_id,
                payout_amount: p.calculation.payout_amount,
                engagement_minutes: p.calculation.instructor_minutes,
                engagement_percentage: p.calculation.engagement_percentage,
                unique_students: p.calculation.breakdown.unique_students,
                courses_with_engagement: p.calculation.breakdown.courses.len() as u32,
            })
            .collect())
    }
}

fn percentage(minutes: i64, platform_minutes: i64) -> Decimal {
    if platform_minutes <= 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(minutes) / Decimal::from(platform_minutes))
        .round_dp_with_strategy(PERCENTAGE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Engagement, EngagementMetadata, EngagementType, RevenueStatus, SubscriptionRevenue};
    use crate::memory::InMemoryStore;
    use crate::ports::PayoutStatusChange;
    use chrono::{DateTime, Duration};
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<InMemoryStore>,
        calculator: PayoutCalculator,
        period: AccountingPeriod,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let calculator = PayoutCalculator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            PayoutConfig::default(),
        );
        Fixture {
            store,
            calculator,
            period: AccountingPeriod::new(3, 2025).unwrap(),
        }
    }

    fn mid_month(period: AccountingPeriod) -> DateTime<Utc> {
        period.start() + Duration::days(14)
    }

    async fn add_revenue(store: &InMemoryStore, amount: Decimal, paid_at: DateTime<Utc>) {
        store
            .insert_revenue(&SubscriptionRevenue {
                id: Uuid::new_v4(),
                subscription_id: Uuid::new_v4(),
                amount,
                currency: "EUR".into(),
                invoice_id: Some(Uuid::new_v4().to_string()),
                payment_intent_id: None,
                payment_method: None,
                billing_period_start: paid_at,
                billing_period_end: paid_at + Duration::days(30),
                status: RevenueStatus::Paid,
                paid_at: Some(paid_at),
                failed_at: None,
                failure_reason: None,
                refunded_at: None,
                refund_amount: None,
                refund_reason: None,
                created_at: paid_at,
            })
            .await
            .unwrap();
    }

    async fn add_minutes(store: &InMemoryStore, course_id: Uuid, minutes: u32, started_at: DateTime<Utc>, counts: bool) {
        store
            .insert_engagement(&Engagement {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                course_id,
                lesson_id: None,
                engagement_type: EngagementType::VideoWatch,
                duration_minutes: minutes,
                started_at,
                completed_at: Some(started_at),
                validation_score: Some(if counts { dec!(0.9) } else { dec!(0.2) }),
                counts_for_payout: counts,
                fraud_flagged: false,
                fraud_reason: None,
                fraud_flagged_at: None,
                metadata: EngagementMetadata::default(),
                validated_at: Some(started_at),
                created_at: started_at,
            })
            .await
            .unwrap();
    }

    fn instructor_with_course(store: &InMemoryStore) -> (Uuid, Uuid) {
        let (instructor, course) = (Uuid::new_v4(), Uuid::new_v4());
        store.add_course(course, instructor);
        (instructor, course)
    }

    #[test]
    fn allocation_splits_pool_by_minutes() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let minutes = BTreeMap::from([(a, 300), (b, 700)]);
        let shares = allocate(dec!(10000), dec!(0.80), 1000, &minutes);
        assert_eq!(shares[&a], dec!(2400.00));
        assert_eq!(shares[&b], dec!(5600.00));
    }

    #[test]
    fn rounding_never_exceeds_the_pool() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let minutes: BTreeMap<Uuid, i64> = ids.iter().map(|id| (*id, 1)).collect();
        let shares = allocate(dec!(100), dec!(0.80), 3, &minutes);

        let total: Decimal = shares.values().sum();
        assert_eq!(total, dec!(80.00));
        let lowest = *ids.iter().min().unwrap();
        assert_eq!(shares[&lowest], dec!(26.66));
        assert_eq!(shares.values().filter(|v| **v == dec!(26.67)).count(), 2);
    }

    #[test]
    fn allocation_holds_under_awkward_splits() {
        for (revenue, platform, parts) in [
            (dec!(999.99), 7, vec![1i64, 2, 4]),
            (dec!(0.05), 3, vec![1, 1, 1]),
            (dec!(12345.67), 1001, vec![333, 333, 335]),
        ] {
            let minutes: BTreeMap<Uuid, i64> = parts.iter().map(|m| (Uuid::new_v4(), *m)).collect();
            let shares = allocate(revenue, dec!(0.80), platform, &minutes);
            let total: Decimal = shares.values().sum();
            assert!(total <= revenue * dec!(0.80), "{} > pool for revenue {}", total, revenue);
            assert!(shares.values().all(|v| *v >= Decimal::ZERO));
        }
    }

    #[tokio::test]
    async fn period_with_two_instructors_splits_eighty_percent() {
        let f = fixture();
        let (alice, alice_course) = instructor_with_course(&f.store);
        let (bob, bob_course) = instructor_with_course(&f.store);
        let at = mid_month(f.period);
        add_revenue(&f.store, dec!(10000), at).await;
        add_minutes(&f.store, alice_course, 300, at, true).await;
        add_minutes(&f.store, bob_course, 700, at, true).await;
        // Non-qualifying minutes do not count toward either side.
        add_minutes(&f.store, bob_course, 5000, at, false).await;

        let payouts = f.calculator.calculate_all_payouts_for_period(3, 2025).await.unwrap();
        assert_eq!(payouts.len(), 2);
        let amount = |id: Uuid| payouts.iter().find(|p| p.instructor_id == id).unwrap().amount();
        assert_eq!(amount(alice), dec!(2400.00));
        assert_eq!(amount(bob), dec!(5600.00));

        let bob_payout = payouts.iter().find(|p| p.instructor_id == bob).unwrap();
        assert_eq!(bob_payout.calculation.engagement_percentage, dec!(0.7));
        assert_eq!(bob_payout.calculation.platform_minutes, 1000);
        assert_eq!(bob_payout.calculation.commission_rate, dec!(0.20));
    }

    #[tokio::test]
    async fn zero_platform_minutes_creates_nothing() {
        let f = fixture();
        add_revenue(&f.store, dec!(500), mid_month(f.period)).await;
        let payouts = f.calculator.calculate_all_payouts_for_period(3, 2025).await.unwrap();
        assert!(payouts.is_empty());
    }

    #[tokio::test]
    async fn engagement_outside_period_is_ignored() {
        let f = fixture();
        let (_, course) = instructor_with_course(&f.store);
        add_minutes(&f.store, course, 60, f.period.end(), true).await;
        add_minutes(&f.store, course, 60, f.period.start() - Duration::seconds(1), true).await;
        assert!(f.calculator.calculate_all_payouts_for_period(3, 2025).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rerunning_and_concurrent_runs_do_not_duplicate() {
        let f = fixture();
        let (_, course) = instructor_with_course(&f.store);
        add_minutes(&f.store, course, 30, mid_month(f.period), true).await;
        add_revenue(&f.store, dec!(100), mid_month(f.period)).await;

        let calculator = Arc::new(f.calculator);
        let runs: Vec<_> = (0..4)
            .map(|_| {
                let c = calculator.clone();
                tokio::spawn(async move { c.calculate_all_payouts_for_period(3, 2025).await })
            })
            .collect();
        for run in runs {
            run.await.unwrap().unwrap();
        }
        let again = calculator.calculate_all_payouts_for_period(3, 2025).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].amount(), dec!(80.00));
    }

    #[tokio::test]
    async fn recalculation_picks_up_late_revenue_and_refuses_paid() {
        let f = fixture();
        let (instructor, course) = instructor_with_course(&f.store);
        let at = mid_month(f.period);
        add_minutes(&f.store, course, 30, at, true).await;
        add_revenue(&f.store, dec!(100), at).await;

        let payout = f.calculator.calculate_all_payouts_for_period(3, 2025).await.unwrap().remove(0);
        assert_eq!(payout.amount(), dec!(80.00));

        add_revenue(&f.store, dec!(50), at).await;
        let updated = f.calculator.recalculate_payout(payout.id).await.unwrap();
        assert_eq!(updated.amount(), dec!(120.00));
        assert_eq!(updated.status, PayoutStatus::Pending);

        let now = Utc::now();
        f.store
            .update_payout_status(payout.id, PayoutStatus::Pending, &PayoutStatusChange::Processing, now)
            .await
            .unwrap();
        f.store
            .update_payout_status(
                payout.id,
                PayoutStatus::Processing,
                &PayoutStatusChange::Paid { transfer_id: Some("tr_1".into()) },
                now,
            )
            .await
            .unwrap();
        assert!(matches!(
            f.calculator.recalculate_payout(payout.id).await,
            Err(ServiceError::InvalidTransition { .. })
        ));
        assert_eq!(f.calculator.get_instructor_total_earned(instructor).await.unwrap(), dec!(120.00));
    }

    #[tokio::test]
    async fn summary_and_history_views() {
        let f = fixture();
        let (alice, alice_course) = instructor_with_course(&f.store);
        let (_, bob_course) = instructor_with_course(&f.store);
        let at = mid_month(f.period);
        add_revenue(&f.store, dec!(1000), at).await;
        add_minutes(&f.store, alice_course, 10, at, true).await;
        add_minutes(&f.store, bob_course, 30, at, true).await;
        f.calculator.calculate_all_payouts_for_period(3, 2025).await.unwrap();

        let summary = f.calculator.get_payout_summary(3, 2025).await.unwrap();
        assert_eq!(summary.total_revenue, dec!(1000));
        assert_eq!(summary.platform_commission, dec!(200.00));
        assert_eq!(summary.total_instructor_payouts, dec!(800.00));
        assert_eq!(summary.total_instructors, 2);
        assert_eq!(summary.payouts_pending, 2);

        let top = f.calculator.top_earning_instructors(3, 2025, 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].payout_amount, dec!(600.00));

        let history = f.calculator.get_instructor_payout_history(alice, 1, 12).await.unwrap();
        assert_eq!(history.payouts.len(), 1);
        assert_eq!(history.payouts[0].payout_amount, dec!(200.00));
        assert_eq!(history.payouts[0].validated_minutes, 10);
        assert_eq!(history.total_earned, Decimal::ZERO);

        assert!(matches!(
            f.calculator.get_instructor_payout_history(alice, 0, 12).await,
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn invalid_period_is_rejected() {
        let f = fixture();
        assert!(matches!(
            f.calculator.calculate_all_payouts_for_period(13, 2025).await,
            Err(ServiceError::InvalidInput(_))
        ));
    }
}
