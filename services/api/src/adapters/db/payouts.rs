//! `PayoutStore` over the `instructor_payouts` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revshare_core::domain::{
    AccountingPeriod, InstructorPayout, PayoutBreakdown, PayoutCalculation, PayoutStatus,
};
use revshare_core::ports::{PayoutStatusChange, PayoutStore, PortError, PortResult};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::{corrupt, db_error, to_limit, DbAdapter, Table};

const COLUMNS: &str = "id, instructor_id, month, year, instructor_minutes, platform_minutes, \
     platform_revenue, engagement_percentage, commission_rate, payout_amount, breakdown, currency, \
     status, transfer_id, error_message, transfer_started_at, transfer_attempt, paid_at, failed_at, \
     created_at, updated_at";

#[derive(FromRow)]
struct PayoutRecord {
    id: Uuid,
    instructor_id: Uuid,
    month: i32,
    year: i32,
    instructor_minutes: i64,
    platform_minutes: i64,
    platform_revenue: Decimal,
    engagement_percentage: Decimal,
    commission_rate: Decimal,
    payout_amount: Decimal,
    breakdown: Json<PayoutBreakdown>,
    currency: String,
    status: String,
    transfer_id: Option<String>,
    error_message: Option<String>,
    transfer_started_at: Option<DateTime<Utc>>,
    transfer_attempt: i32,
    paid_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PayoutRecord {
    fn to_domain(self) -> PortResult<InstructorPayout> {
        let month = u32::try_from(self.month).map_err(|e| corrupt("month", e))?;
        let period = AccountingPeriod::new(month, self.year).map_err(|e| corrupt("month/year", e))?;
        Ok(InstructorPayout {
            id: self.id,
            instructor_id: self.instructor_id,
            period,
            calculation: PayoutCalculation {
                instructor_minutes: self.instructor_minutes,
                platform_minutes: self.platform_minutes,
                platform_revenue: self.platform_revenue,
                engagement_percentage: self.engagement_percentage,
                commission_rate: self.commission_rate,
                payout_amount: self.payout_amount,
                breakdown: self.breakdown.0,
            },
            currency: self.currency,
            status: self
                .status
                .parse::<PayoutStatus>()
                .map_err(|e| corrupt("status", e))?,
            transfer_id: self.transfer_id,
            error_message: self.error_message,
            transfer_started_at: self.transfer_started_at,
            transfer_attempt: u32::try_from(self.transfer_attempt)
                .map_err(|e| corrupt("transfer_attempt", e))?,
            paid_at: self.paid_at,
            failed_at: self.failed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn to_domain_all(records: Vec<PayoutRecord>) -> PortResult<Vec<InstructorPayout>> {
    records.into_iter().map(PayoutRecord::to_domain).collect()
}

fn month(period: AccountingPeriod) -> i32 {
    // Always 1..=12 once constructed.
    period.month as i32
}

#[async_trait]
impl PayoutStore for DbAdapter {
    async fn insert_payout(&self, payout: &InstructorPayout) -> PortResult<bool> {
        let sql = format!(
            "INSERT INTO instructor_payouts ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21) \
             ON CONFLICT DO NOTHING",
            COLUMNS
        );
        let calc = &payout.calculation;
        let result = sqlx::query(&sql)
            .bind(payout.id)
            .bind(payout.instructor_id)
            .bind(month(payout.period))
            .bind(payout.period.year)
            .bind(calc.instructor_minutes)
            .bind(calc.platform_minutes)
            .bind(calc.platform_revenue)
            .bind(calc.engagement_percentage)
            .bind(calc.commission_rate)
            .bind(calc.payout_amount)
            .bind(Json(&calc.breakdown))
            .bind(&payout.currency)
            .bind(payout.status.as_str())
            .bind(payout.transfer_id.as_deref())
            .bind(payout.error_message.as_deref())
            .bind(payout.transfer_started_at)
            .bind(i32::try_from(payout.transfer_attempt).map_err(|e| corrupt("transfer_attempt", e))?)
            .bind(payout.paid_at)
            .bind(payout.failed_at)
            .bind(payout.created_at)
            .bind(payout.updated_at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_payout(&self, id: Uuid) -> PortResult<InstructorPayout> {
        let sql = format!("SELECT {} FROM instructor_payouts WHERE id = $1", COLUMNS);
        sqlx::query_as::<_, PayoutRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| PortError::NotFound(format!("Payout {}", id)))?
            .to_domain()
    }

    async fn find_payout(
        &self,
        instructor_id: Uuid,
        period: AccountingPeriod,
    ) -> PortResult<Option<InstructorPayout>> {
        let sql = format!(
            "SELECT {} FROM instructor_payouts WHERE instructor_id = $1 AND month = $2 AND year = $3",
            COLUMNS
        );
        sqlx::query_as::<_, PayoutRecord>(&sql)
            .bind(instructor_id)
            .bind(month(period))
            .bind(period.year)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(PayoutRecord::to_domain)
            .transpose()
    }

    async fn payouts_for_period(&self, period: AccountingPeriod) -> PortResult<Vec<InstructorPayout>> {
        let sql = format!(
            "SELECT {} FROM instructor_payouts WHERE month = $1 AND year = $2 ORDER BY instructor_id",
            COLUMNS
        );
        let records = sqlx::query_as::<_, PayoutRecord>(&sql)
            .bind(month(period))
            .bind(period.year)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        to_domain_all(records)
    }

    async fn payouts_for_instructor(
        &self,
        instructor_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> PortResult<Vec<InstructorPayout>> {
        let sql = format!(
            "SELECT {} FROM instructor_payouts WHERE instructor_id = $1 \
             ORDER BY year DESC, month DESC OFFSET $2 LIMIT $3",
            COLUMNS
        );
        let records = sqlx::query_as::<_, PayoutRecord>(&sql)
            .bind(instructor_id)
            .bind(to_limit(offset))
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        to_domain_all(records)
    }

    async fn payouts_with_status(
        &self,
        status: PayoutStatus,
        limit: usize,
    ) -> PortResult<Vec<InstructorPayout>> {
        let sql = format!(
            "SELECT {} FROM instructor_payouts \
             WHERE status = $1 AND ($1 <> 'processing' OR transfer_started_at IS NULL) \
             ORDER BY created_at, id LIMIT $2",
            COLUMNS
        );
        let records = sqlx::query_as::<_, PayoutRecord>(&sql)
            .bind(status.as_str())
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        to_domain_all(records)
    }

    async fn update_payout_status(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        change: &PayoutStatusChange,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let query = match change {
            PayoutStatusChange::Processing => sqlx::query(
                "UPDATE instructor_payouts \
                 SET status = 'processing', transfer_started_at = NULL, error_message = NULL, updated_at = $3 \
                 WHERE id = $1 AND status = $2",
            )
            .bind(id)
            .bind(expected.as_str())
            .bind(at),
            PayoutStatusChange::Paid { transfer_id } => sqlx::query(
                "UPDATE instructor_payouts \
                 SET status = 'paid', transfer_id = $4, paid_at = $3, error_message = NULL, updated_at = $3 \
                 WHERE id = $1 AND status = $2",
            )
            .bind(id)
            .bind(expected.as_str())
            .bind(at)
            .bind(transfer_id.as_deref()),
            PayoutStatusChange::Failed { reason } => sqlx::query(
                "UPDATE instructor_payouts \
                 SET status = 'failed', error_message = $4, failed_at = $3, updated_at = $3 \
                 WHERE id = $1 AND status = $2",
            )
            .bind(id)
            .bind(expected.as_str())
            .bind(at)
            .bind(reason.as_str()),
            PayoutStatusChange::Pending { next_attempt } => sqlx::query(
                "UPDATE instructor_payouts \
                 SET status = 'pending', error_message = NULL, transfer_started_at = NULL, \
                     transfer_attempt = transfer_attempt + CASE WHEN $4 THEN 1 ELSE 0 END, updated_at = $3 \
                 WHERE id = $1 AND status = $2",
            )
            .bind(id)
            .bind(expected.as_str())
            .bind(at)
            .bind(*next_attempt),
        };

        let result = query.execute(&self.pool).await.map_err(db_error)?;
        if result.rows_affected() == 0 {
            self.require_row(Table::Payouts, id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn claim_transfer(&self, id: Uuid, at: DateTime<Utc>) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE instructor_payouts SET transfer_started_at = $2, updated_at = $2 \
             WHERE id = $1 AND status = 'processing' AND transfer_started_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            self.require_row(Table::Payouts, id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn replace_calculation(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        calculation: &PayoutCalculation,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE instructor_payouts \
             SET instructor_minutes = $3, platform_minutes = $4, platform_revenue = $5, \
                 engagement_percentage = $6, commission_rate = $7, payout_amount = $8, breakdown = $9, \
                 status = 'pending', error_message = NULL, transfer_started_at = NULL, updated_at = $10 \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(calculation.instructor_minutes)
        .bind(calculation.platform_minutes)
        .bind(calculation.platform_revenue)
        .bind(calculation.engagement_percentage)
        .bind(calculation.commission_rate)
        .bind(calculation.payout_amount)
        .bind(Json(&calculation.breakdown))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            self.require_row(Table::Payouts, id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn total_paid_to(&self, instructor_id: Uuid) -> PortResult<Decimal> {
        sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(payout_amount), 0) FROM instructor_payouts \
             WHERE instructor_id = $1 AND status = 'paid'",
        )
        .bind(instructor_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }
}
