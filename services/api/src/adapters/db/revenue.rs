//! `RevenueStore` over the `subscription_revenues` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revshare_core::domain::{RevenueStatus, SubscriptionRevenue};
use revshare_core::ports::{PortError, PortResult, RevenueStats, RevenueStatusChange, RevenueStore};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use super::{corrupt, db_error, DbAdapter, Table};

const COLUMNS: &str = "id, subscription_id, amount, currency, invoice_id, payment_intent_id, \
     payment_method, billing_period_start, billing_period_end, status, paid_at, failed_at, \
     failure_reason, refunded_at, refund_amount, refund_reason, created_at";

#[derive(FromRow)]
struct RevenueRecord {
    id: Uuid,
    subscription_id: Uuid,
    amount: Decimal,
    currency: String,
    invoice_id: Option<String>,
    payment_intent_id: Option<String>,
    payment_method: Option<String>,
    billing_period_start: DateTime<Utc>,
    billing_period_end: DateTime<Utc>,
    status: String,
    paid_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    refunded_at: Option<DateTime<Utc>>,
    refund_amount: Option<Decimal>,
    refund_reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl RevenueRecord {
    fn to_domain(self) -> PortResult<SubscriptionRevenue> {
        Ok(SubscriptionRevenue {
            id: self.id,
            subscription_id: self.subscription_id,
            amount: self.amount,
            currency: self.currency,
            invoice_id: self.invoice_id,
            payment_intent_id: self.payment_intent_id,
            payment_method: self.payment_method,
            billing_period_start: self.billing_period_start,
            billing_period_end: self.billing_period_end,
            status: self
                .status
                .parse::<RevenueStatus>()
                .map_err(|e| corrupt("status", e))?,
            paid_at: self.paid_at,
            failed_at: self.failed_at,
            failure_reason: self.failure_reason,
            refunded_at: self.refunded_at,
            refund_amount: self.refund_amount,
            refund_reason: self.refund_reason,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct StatsRecord {
    paid_total: Decimal,
    paid_count: i64,
    failed_count: i64,
    refunded_count: i64,
    charged_back_count: i64,
}

#[async_trait]
impl RevenueStore for DbAdapter {
    async fn insert_revenue(&self, revenue: &SubscriptionRevenue) -> PortResult<bool> {
        // Without a conflict target this covers both the primary key and the
        // partial unique index on invoice_id.
        let sql = format!(
            "INSERT INTO subscription_revenues ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             ON CONFLICT DO NOTHING",
            COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(revenue.id)
            .bind(revenue.subscription_id)
            .bind(revenue.amount)
            .bind(&revenue.currency)
            .bind(revenue.invoice_id.as_deref())
            .bind(revenue.payment_intent_id.as_deref())
            .bind(revenue.payment_method.as_deref())
            .bind(revenue.billing_period_start)
            .bind(revenue.billing_period_end)
            .bind(revenue.status.as_str())
            .bind(revenue.paid_at)
            .bind(revenue.failed_at)
            .bind(revenue.failure_reason.as_deref())
            .bind(revenue.refunded_at)
            .bind(revenue.refund_amount)
            .bind(revenue.refund_reason.as_deref())
            .bind(revenue.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_revenue(&self, id: Uuid) -> PortResult<SubscriptionRevenue> {
        let sql = format!("SELECT {} FROM subscription_revenues WHERE id = $1", COLUMNS);
        sqlx::query_as::<_, RevenueRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| PortError::NotFound(format!("Revenue {}", id)))?
            .to_domain()
    }

    async fn find_by_invoice(&self, invoice_id: &str) -> PortResult<Option<SubscriptionRevenue>> {
        let sql = format!("SELECT {} FROM subscription_revenues WHERE invoice_id = $1", COLUMNS);
        sqlx::query_as::<_, RevenueRecord>(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(RevenueRecord::to_domain)
            .transpose()
    }

    async fn update_revenue_status(
        &self,
        id: Uuid,
        expected: RevenueStatus,
        change: &RevenueStatusChange,
    ) -> PortResult<bool> {
        let query = match change {
            RevenueStatusChange::Paid { paid_at } => sqlx::query(
                "UPDATE subscription_revenues SET status = 'paid', paid_at = $3, failure_reason = NULL \
                 WHERE id = $1 AND status = $2",
            )
            .bind(id)
            .bind(expected.as_str())
            .bind(*paid_at),
            RevenueStatusChange::Failed { reason, failed_at } => sqlx::query(
                "UPDATE subscription_revenues SET status = 'failed', failed_at = $3, failure_reason = $4 \
                 WHERE id = $1 AND status = $2",
            )
            .bind(id)
            .bind(expected.as_str())
            .bind(*failed_at)
            .bind(reason.as_str()),
            RevenueStatusChange::Refunded { amount, reason, refunded_at: at }
            | RevenueStatusChange::ChargedBack { amount, reason, charged_back_at: at } => sqlx::query(
                "UPDATE subscription_revenues \
                 SET status = $3, refunded_at = $4, refund_amount = $5, refund_reason = $6 \
                 WHERE id = $1 AND status = $2",
            )
            .bind(id)
            .bind(expected.as_str())
            .bind(change.target().as_str())
            .bind(*at)
            .bind(*amount)
            .bind(reason.as_str()),
        };

        let result = query.execute(&self.pool).await.map_err(db_error)?;
        if result.rows_affected() == 0 {
            self.require_row(Table::Revenues, id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn total_paid(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PortResult<Decimal> {
        sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(amount), 0) FROM subscription_revenues \
             WHERE status = 'paid' AND paid_at >= $1 AND paid_at < $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn revenue_stats(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PortResult<RevenueStats> {
        let record = sqlx::query_as::<_, StatsRecord>(
            "SELECT \
               COALESCE(SUM(amount) FILTER (WHERE status = 'paid' AND paid_at >= $1 AND paid_at < $2), 0) AS paid_total, \
               COUNT(*) FILTER (WHERE status = 'paid' AND paid_at >= $1 AND paid_at < $2) AS paid_count, \
               COUNT(*) FILTER (WHERE status = 'failed' AND failed_at >= $1 AND failed_at < $2) AS failed_count, \
               COUNT(*) FILTER (WHERE status = 'refunded' AND refunded_at >= $1 AND refunded_at < $2) AS refunded_count, \
               COUNT(*) FILTER (WHERE status = 'charged_back' AND refunded_at >= $1 AND refunded_at < $2) AS charged_back_count \
             FROM subscription_revenues",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(RevenueStats {
            paid_total: record.paid_total,
            paid_count: record.paid_count,
            failed_count: record.failed_count,
            refunded_count: record.refunded_count,
            charged_back_count: record.charged_back_count,
        })
    }
}
