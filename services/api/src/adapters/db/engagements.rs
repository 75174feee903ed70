//! `EngagementStore` over the `engagements` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revshare_core::domain::{Engagement, EngagementMetadata, EngagementType};
use revshare_core::ports::{EngagementQuery, EngagementStore, PortError, PortResult, QualifyingMinutes};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::{corrupt, db_error, to_limit, DbAdapter, Table};

const COLUMNS: &str = "id, user_id, course_id, lesson_id, engagement_type, duration_minutes, \
     started_at, completed_at, validation_score, counts_for_payout, fraud_flagged, fraud_reason, \
     fraud_flagged_at, metadata, validated_at, created_at";

#[derive(FromRow)]
struct EngagementRecord {
    id: Uuid,
    user_id: Uuid,
    course_id: Uuid,
    lesson_id: Option<Uuid>,
    engagement_type: String,
    duration_minutes: i32,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    validation_score: Option<Decimal>,
    counts_for_payout: bool,
    fraud_flagged: bool,
    fraud_reason: Option<String>,
    fraud_flagged_at: Option<DateTime<Utc>>,
    metadata: Json<EngagementMetadata>,
    validated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl EngagementRecord {
    fn to_domain(self) -> PortResult<Engagement> {
        Ok(Engagement {
            id: self.id,
            user_id: self.user_id,
            course_id: self.course_id,
            lesson_id: self.lesson_id,
            engagement_type: self
                .engagement_type
                .parse::<EngagementType>()
                .map_err(|e| corrupt("engagement_type", e))?,
            duration_minutes: u32::try_from(self.duration_minutes)
                .map_err(|e| corrupt("duration_minutes", e))?,
            started_at: self.started_at,
            completed_at: self.completed_at,
            validation_score: self.validation_score,
            counts_for_payout: self.counts_for_payout,
            fraud_flagged: self.fraud_flagged,
            fraud_reason: self.fraud_reason,
            fraud_flagged_at: self.fraud_flagged_at,
            metadata: self.metadata.0,
            validated_at: self.validated_at,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct QualifyingRecord {
    course_id: Uuid,
    user_id: Uuid,
    minutes: i64,
    engagements: i64,
}

fn to_domain_all(records: Vec<EngagementRecord>) -> PortResult<Vec<Engagement>> {
    records.into_iter().map(EngagementRecord::to_domain).collect()
}

fn duration(minutes: u32) -> PortResult<i32> {
    i32::try_from(minutes).map_err(|e| PortError::Unexpected(format!("Duration out of range: {}", e)))
}

#[async_trait]
impl EngagementStore for DbAdapter {
    async fn insert_engagement(&self, engagement: &Engagement) -> PortResult<()> {
        let sql = format!(
            "INSERT INTO engagements ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(engagement.id)
            .bind(engagement.user_id)
            .bind(engagement.course_id)
            .bind(engagement.lesson_id)
            .bind(engagement.engagement_type.as_str())
            .bind(duration(engagement.duration_minutes)?)
            .bind(engagement.started_at)
            .bind(engagement.completed_at)
            .bind(engagement.validation_score)
            .bind(engagement.counts_for_payout)
            .bind(engagement.fraud_flagged)
            .bind(engagement.fraud_reason.as_deref())
            .bind(engagement.fraud_flagged_at)
            .bind(Json(&engagement.metadata))
            .bind(engagement.validated_at)
            .bind(engagement.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn get_engagement(&self, id: Uuid) -> PortResult<Engagement> {
        let sql = format!("SELECT {} FROM engagements WHERE id = $1", COLUMNS);
        sqlx::query_as::<_, EngagementRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| PortError::NotFound(format!("Engagement {}", id)))?
            .to_domain()
    }

    async fn fingerprint_seen(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        started_before: DateTime<Utc>,
    ) -> PortResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM engagements \
             WHERE user_id = $1 AND started_at < $3 AND NOT fraud_flagged \
             AND metadata ->> 'device_fingerprint' = $2)",
        )
        .bind(user_id)
        .bind(fingerprint)
        .bind(started_before)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn complete_session(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        duration_minutes: u32,
        metadata: &EngagementMetadata,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE engagements SET completed_at = $2, duration_minutes = $3, metadata = $4 \
             WHERE id = $1 AND completed_at IS NULL AND validation_score IS NULL",
        )
        .bind(id)
        .bind(completed_at)
        .bind(duration(duration_minutes)?)
        .bind(Json(metadata))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            self.require_row(Table::Engagements, id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn pending_validation(
        &self,
        completed_after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> PortResult<Vec<Engagement>> {
        let sql = format!(
            "SELECT {} FROM engagements \
             WHERE validation_score IS NULL AND completed_at IS NOT NULL \
               AND ($1::timestamptz IS NULL OR completed_at > $1) \
             ORDER BY completed_at, id LIMIT $2",
            COLUMNS
        );
        let records = sqlx::query_as::<_, EngagementRecord>(&sql)
            .bind(completed_after)
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        to_domain_all(records)
    }

    async fn apply_validation(
        &self,
        id: Uuid,
        score: Decimal,
        counts_for_payout: bool,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE engagements \
             SET validation_score = $2, counts_for_payout = ($3 AND NOT fraud_flagged), validated_at = $4 \
             WHERE id = $1 AND validation_score IS NULL",
        )
        .bind(id)
        .bind(score)
        .bind(counts_for_payout)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            self.require_row(Table::Engagements, id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn override_validation(
        &self,
        id: Uuid,
        score: Decimal,
        counts_for_payout: bool,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE engagements SET validation_score = $2, counts_for_payout = $3, validated_at = $4 \
             WHERE id = $1 AND NOT fraud_flagged",
        )
        .bind(id)
        .bind(score)
        .bind(counts_for_payout)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            self.require_row(Table::Engagements, id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn flag_fraudulent(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE engagements \
             SET fraud_flagged = TRUE, fraud_reason = $2, fraud_flagged_at = $3, \
                 validation_score = 0, counts_for_payout = FALSE, validated_at = $3 \
             WHERE id = $1 AND NOT fraud_flagged",
        )
        .bind(id)
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            self.require_row(Table::Engagements, id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn list_engagements(&self, query: &EngagementQuery) -> PortResult<Vec<Engagement>> {
        let sql = format!(
            "SELECT {} FROM engagements \
             WHERE ($1::uuid IS NULL OR user_id = $1) \
               AND ($2::uuid IS NULL OR course_id = $2) \
               AND started_at >= $3 AND started_at < $4 \
             ORDER BY started_at, id",
            COLUMNS
        );
        let records = sqlx::query_as::<_, EngagementRecord>(&sql)
            .bind(query.user_id)
            .bind(query.course_id)
            .bind(query.started_from)
            .bind(query.started_before)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        to_domain_all(records)
    }

    async fn qualifying_minutes(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PortResult<Vec<QualifyingMinutes>> {
        let records = sqlx::query_as::<_, QualifyingRecord>(
            "SELECT course_id, user_id, SUM(duration_minutes)::BIGINT AS minutes, COUNT(*) AS engagements \
             FROM engagements \
             WHERE counts_for_payout AND NOT fraud_flagged AND started_at >= $1 AND started_at < $2 \
             GROUP BY course_id, user_id \
             ORDER BY course_id, user_id",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(records
            .into_iter()
            .map(|r| QualifyingMinutes {
                course_id: r.course_id,
                user_id: r.user_id,
                minutes: r.minutes,
                engagements: r.engagements,
            })
            .collect())
    }
}
