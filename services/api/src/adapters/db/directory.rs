//! Read-mostly collaborator mirrors: course ownership, connect accounts and
//! active subscriptions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revshare_core::domain::{
    ActiveSubscription, BillingInterval, InstructorConnectAccount, OnboardingStatus,
};
use revshare_core::ports::{
    ConnectAccountDirectory, CourseCatalog, PortError, PortResult, SubscriptionDirectory,
};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use super::{corrupt, db_error, DbAdapter};

#[derive(FromRow)]
struct CourseOwnerRecord {
    id: Uuid,
    instructor_id: Uuid,
}

#[derive(FromRow)]
struct ConnectAccountRecord {
    instructor_id: Uuid,
    external_account_id: String,
    onboarding_status: String,
    payouts_enabled: bool,
    charges_enabled: bool,
    total_paid_out: Decimal,
    last_payout_at: Option<DateTime<Utc>>,
    disabled_at: Option<DateTime<Utc>>,
    disabled_reason: Option<String>,
}

impl ConnectAccountRecord {
    fn to_domain(self) -> PortResult<InstructorConnectAccount> {
        Ok(InstructorConnectAccount {
            instructor_id: self.instructor_id,
            external_account_id: self.external_account_id,
            onboarding_status: self
                .onboarding_status
                .parse::<OnboardingStatus>()
                .map_err(|e| corrupt("onboarding_status", e))?,
            payouts_enabled: self.payouts_enabled,
            charges_enabled: self.charges_enabled,
            total_paid_out: self.total_paid_out,
            last_payout_at: self.last_payout_at,
            disabled_at: self.disabled_at,
            disabled_reason: self.disabled_reason,
        })
    }
}

#[derive(FromRow)]
struct ActiveSubscriptionRecord {
    subscription_id: Uuid,
    plan_name: String,
    billing_interval: String,
    price_monthly: Decimal,
    price_yearly: Option<Decimal>,
}

impl ActiveSubscriptionRecord {
    fn to_domain(self) -> PortResult<ActiveSubscription> {
        let billing_interval = match self.billing_interval.as_str() {
            "monthly" => BillingInterval::Monthly,
            "yearly" => BillingInterval::Yearly,
            other => return Err(corrupt("billing_interval", other)),
        };
        Ok(ActiveSubscription {
            subscription_id: self.subscription_id,
            plan_name: self.plan_name,
            billing_interval,
            price_monthly: self.price_monthly,
            price_yearly: self.price_yearly,
        })
    }
}

#[async_trait]
impl CourseCatalog for DbAdapter {
    async fn course_owners(&self, course_ids: &[Uuid]) -> PortResult<HashMap<Uuid, Uuid>> {
        if course_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let records = sqlx::query_as::<_, CourseOwnerRecord>(
            "SELECT id, instructor_id FROM courses WHERE id = ANY($1)",
        )
        .bind(course_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(records.into_iter().map(|r| (r.id, r.instructor_id)).collect())
    }
}

#[async_trait]
impl ConnectAccountDirectory for DbAdapter {
    async fn connect_account(&self, instructor_id: Uuid) -> PortResult<Option<InstructorConnectAccount>> {
        sqlx::query_as::<_, ConnectAccountRecord>(
            "SELECT instructor_id, external_account_id, onboarding_status, payouts_enabled, \
                    charges_enabled, total_paid_out, last_payout_at, disabled_at, disabled_reason \
             FROM instructor_connect_accounts WHERE instructor_id = $1",
        )
        .bind(instructor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(ConnectAccountRecord::to_domain)
        .transpose()
    }

    async fn record_payout(
        &self,
        instructor_id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE instructor_connect_accounts \
             SET total_paid_out = total_paid_out + $2, last_payout_at = $3, updated_at = $3 \
             WHERE instructor_id = $1",
        )
        .bind(instructor_id)
        .bind(amount)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Connect account for {}", instructor_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionDirectory for DbAdapter {
    async fn active_subscriptions(&self, as_of: DateTime<Utc>) -> PortResult<Vec<ActiveSubscription>> {
        let records = sqlx::query_as::<_, ActiveSubscriptionRecord>(
            "SELECT us.id AS subscription_id, sp.name AS plan_name, us.billing_interval, \
                    sp.price_monthly, sp.price_yearly \
             FROM user_subscriptions us \
             JOIN subscription_plans sp ON sp.id = us.plan_id \
             WHERE us.active_from <= $1 AND (us.active_until IS NULL OR us.active_until > $1)",
        )
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        records.into_iter().map(ActiveSubscriptionRecord::to_domain).collect()
    }
}
