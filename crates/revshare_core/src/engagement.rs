//! crates/revshare_core/src/engagement.rs
//!
//! The Engagement Recorder, the Batch Validator and the read-side analytics
//! over engagement records.
//!
//! Recording never depends on the score: every well-formed session is
//! persisted, and the score only decides `counts_for_payout`. Scoring happens
//! inline when the session arrives complete, otherwise the record stays
//! pending until `validate_pending` picks it up.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{
    AccountingPeriod, CourseEngagementDetail, Engagement, EngagementMetadata, EngagementType,
    PayoutBreakdown, SessionSignals,
};
use crate::error::{invalid, ServiceError, ServiceResult};
use crate::fraud::{self, FingerprintStatus, FraudConfig, ScoreInputs};
use crate::ports::{CourseCatalog, EngagementQuery, EngagementStore, QualifyingMinutes};

#[derive(Debug, Clone)]
pub struct EngagementConfig {
    pub fraud: FraudConfig,
    /// Sessions longer than this are rejected as malformed.
    pub max_session_minutes: u32,
    /// Scores below this are reported as suspicious.
    pub suspicious_threshold: Decimal,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            fraud: FraudConfig::default(),
            max_session_minutes: 24 * 60,
            suspicious_threshold: Decimal::new(30, 2),
        }
    }
}

/// A raw session report as received from the client.
#[derive(Debug, Clone)]
pub struct EngagementReport {
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub lesson_id: Option<Uuid>,
    pub engagement_type: EngagementType,
    pub duration_minutes: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: EngagementMetadata,
}

/// Late-arriving data that closes an open session.
#[derive(Debug, Clone)]
pub struct SessionCompletion {
    pub completed_at: DateTime<Utc>,
    /// Replaces the reported duration when present.
    pub duration_minutes: Option<i64>,
    pub signals: SessionSignals,
}

//=========================================================================================
// Analytics read models
//=========================================================================================

/// Totals shared by the per-user and per-course views.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngagementTotals {
    pub total_engagements: u32,
    pub validated_engagements: u32,
    pub total_minutes: i64,
    pub validated_minutes: i64,
    /// Mean over scored records; `None` when nothing is scored yet.
    pub average_score: Option<Decimal>,
    pub minutes_by_type: BTreeMap<EngagementType, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserEngagementAnalytics {
    pub user_id: Uuid,
    pub unique_courses: u32,
    pub totals: EngagementTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseEngagementAnalytics {
    pub course_id: Uuid,
    pub unique_users: u32,
    pub totals: EngagementTotals,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FraudStatistics {
    pub total: u32,
    pub validated: u32,
    pub pending: u32,
    pub suspicious: u32,
    pub flagged: u32,
    pub average_score: Option<Decimal>,
    /// Flagged records over all records, 4 decimals.
    pub fraud_rate: Decimal,
}

/// Qualifying minutes and audit breakdown attributed to one instructor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructorAttribution {
    pub minutes: i64,
    pub breakdown: PayoutBreakdown,
}

/// Groups per-course qualifying minutes under the owning instructor. Courses
/// without a known owner are skipped.
pub fn attribute_to_instructors(
    rows: &[QualifyingMinutes],
    owners: &HashMap<Uuid, Uuid>,
) -> BTreeMap<Uuid, InstructorAttribution> {
    #[derive(Default)]
    struct CourseAcc {
        minutes: i64,
        engagements: i64,
        students: BTreeSet<Uuid>,
    }

    let mut per_instructor: BTreeMap<Uuid, BTreeMap<Uuid, CourseAcc>> = BTreeMap::new();
    for row in rows {
        let Some(instructor_id) = owners.get(&row.course_id) else {
            warn!(course_id = %row.course_id, minutes = row.minutes, "Qualifying minutes on a course without an owner; skipped");
            continue;
        };
        let course = per_instructor
            .entry(*instructor_id)
            .or_default()
            .entry(row.course_id)
            .or_default();
        course.minutes += row.minutes;
        course.engagements += row.engagements;
        course.students.insert(row.user_id);
    }

    per_instructor
        .into_iter()
        .map(|(instructor_id, courses)| {
            let mut students = BTreeSet::new();
            let mut attribution = InstructorAttribution::default();
            for (course_id, acc) in courses {
                attribution.minutes += acc.minutes;
                attribution.breakdown.engagements += to_u32(acc.engagements);
                students.extend(acc.students.iter().copied());
                attribution.breakdown.courses.push(CourseEngagementDetail {
                    course_id,
                    validated_minutes: acc.minutes,
                    unique_students: to_u32(acc.students.len() as i64),
                    engagements: to_u32(acc.engagements),
                });
            }
            attribution.breakdown.unique_students = to_u32(students.len() as i64);
            (instructor_id, attribution)
        })
        .collect()
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

//=========================================================================================
// Service
//=========================================================================================

pub struct EngagementService {
    store: Arc<dyn EngagementStore>,
    catalog: Arc<dyn CourseCatalog>,
    config: EngagementConfig,
}

impl EngagementService {
    pub fn new(
        store: Arc<dyn EngagementStore>,
        catalog: Arc<dyn CourseCatalog>,
        config: EngagementConfig,
    ) -> Self {
        Self { store, catalog, config }
    }

    pub fn config(&self) -> &EngagementConfig {
        &self.config
    }

    /// Validates and persists one session report, scoring it inline when the
    /// session is complete.
    pub async fn record_engagement(&self, report: EngagementReport) -> ServiceResult<Engagement> {
        let duration_minutes = self.check_duration(report.duration_minutes)?;
        if let Some(completed_at) = report.completed_at {
            if completed_at < report.started_at {
                return Err(invalid("Completion time precedes start time"));
            }
        }
        check_signals(&report.metadata.signals)?;

        let now = Utc::now();
        let mut engagement = Engagement {
            id: Uuid::new_v4(),
            user_id: report.user_id,
            course_id: report.course_id,
            lesson_id: report.lesson_id,
            engagement_type: report.engagement_type,
            duration_minutes,
            started_at: report.started_at,
            completed_at: report.completed_at,
            validation_score: None,
            counts_for_payout: false,
            fraud_flagged: false,
            fraud_reason: None,
            fraud_flagged_at: None,
            metadata: report.metadata,
            validated_at: None,
            created_at: now,
        };

        if engagement.completed_at.is_some() && engagement.metadata.signals.is_complete() {
            let fingerprint = self.fingerprint_status(&engagement).await?;
            if let Some(inputs) = ScoreInputs::from_signals(&engagement.metadata.signals, fingerprint) {
                let score = fraud::score(&inputs);
                engagement.validation_score = Some(score);
                engagement.counts_for_payout = self.config.fraud.counts_for_payout(score, false);
                engagement.validated_at = Some(now);
            }
        }

        self.store.insert_engagement(&engagement).await?;
        match engagement.validation_score {
            Some(score) => info!(
                engagement_id = %engagement.id,
                user_id = %engagement.user_id,
                %score,
                counts_for_payout = engagement.counts_for_payout,
                "Engagement recorded and scored"
            ),
            None => info!(
                engagement_id = %engagement.id,
                user_id = %engagement.user_id,
                "Engagement recorded, score pending"
            ),
        }
        Ok(engagement)
    }

    /// Closes an open session. The record stays pending for the Batch Validator.
    pub async fn complete_session(
        &self,
        engagement_id: Uuid,
        completion: SessionCompletion,
    ) -> ServiceResult<Engagement> {
        let engagement = self.store.get_engagement(engagement_id).await?;
        if engagement.completed_at.is_some() || !engagement.is_pending() {
            return Err(ServiceError::InvalidTransition {
                entity: "engagement",
                id: engagement_id,
                from: engagement_state(&engagement).to_string(),
                to: "completed".to_string(),
            });
        }
        if completion.completed_at < engagement.started_at {
            return Err(invalid("Completion time precedes start time"));
        }
        check_signals(&completion.signals)?;
        let duration_minutes = match completion.duration_minutes {
            Some(minutes) => self.check_duration(minutes)?,
            None => engagement.duration_minutes,
        };

        let mut metadata = engagement.metadata.clone();
        metadata.signals.merge(&completion.signals);

        let stamped = self
            .store
            .complete_session(engagement_id, completion.completed_at, duration_minutes, &metadata)
            .await?;
        if !stamped {
            let current = self.store.get_engagement(engagement_id).await?;
            return Err(ServiceError::InvalidTransition {
                entity: "engagement",
                id: engagement_id,
                from: engagement_state(&current).to_string(),
                to: "completed".to_string(),
            });
        }
        debug!(engagement_id = %engagement_id, "Engagement session completed");
        Ok(self.store.get_engagement(engagement_id).await?)
    }

    /// Scores up to `batch_size` completed, pending records. Returns how many
    /// were scored by this call. Per-record failures are logged and skipped.
    pub async fn validate_pending(
        &self,
        since: Option<DateTime<Utc>>,
        batch_size: usize,
    ) -> ServiceResult<usize> {
        if batch_size == 0 {
            return Ok(0);
        }
        let batch = self.store.pending_validation(since, batch_size).await?;
        let mut validated = 0;

        for engagement in &batch {
            match self.validate_one(engagement).await {
                Ok(true) => validated += 1,
                Ok(false) => debug!(engagement_id = %engagement.id, "Engagement already scored by another worker"),
                Err(e) => error!(engagement_id = %engagement.id, "Failed to validate engagement: {:?}", e),
            }
        }

        info!(selected = batch.len(), validated, "Batch validation finished");
        Ok(validated)
    }

    async fn validate_one(&self, engagement: &Engagement) -> ServiceResult<bool> {
        let fingerprint = self.fingerprint_status(engagement).await?;
        let (score, counts) = match ScoreInputs::from_signals(&engagement.metadata.signals, fingerprint) {
            Some(inputs) => {
                let score = fraud::score(&inputs);
                (score, self.config.fraud.counts_for_payout(score, engagement.fraud_flagged))
            }
            None => {
                warn!(engagement_id = %engagement.id, "Mandatory signals missing; scoring as zero");
                (Decimal::ZERO, false)
            }
        };
        Ok(self
            .store
            .apply_validation(engagement.id, score, counts, Utc::now())
            .await?)
    }

    /// Admin override: zero score, excluded from payouts. Repeating it is a no-op.
    pub async fn mark_engagement_as_fraudulent(
        &self,
        engagement_id: Uuid,
        reason: &str,
    ) -> ServiceResult<Engagement> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(invalid("A reason is required to flag an engagement"));
        }
        self.store.get_engagement(engagement_id).await?;

        if self.store.flag_fraudulent(engagement_id, reason, Utc::now()).await? {
            warn!(engagement_id = %engagement_id, reason, "Engagement marked fraudulent");
        } else {
            debug!(engagement_id = %engagement_id, "Engagement already flagged");
        }
        Ok(self.store.get_engagement(engagement_id).await?)
    }

    /// Admin override: recomputes the score from stored signals and overwrites it.
    pub async fn recalculate_validation_score(&self, engagement_id: Uuid) -> ServiceResult<Engagement> {
        let engagement = self.store.get_engagement(engagement_id).await?;
        if engagement.fraud_flagged || engagement.completed_at.is_none() {
            return Err(ServiceError::InvalidTransition {
                entity: "engagement",
                id: engagement_id,
                from: engagement_state(&engagement).to_string(),
                to: "rescored".to_string(),
            });
        }

        let fingerprint = self.fingerprint_status(&engagement).await?;
        let score = ScoreInputs::from_signals(&engagement.metadata.signals, fingerprint)
            .map(|inputs| fraud::score(&inputs))
            .unwrap_or(Decimal::ZERO);
        let counts = self.config.fraud.counts_for_payout(score, false);

        if !self
            .store
            .override_validation(engagement_id, score, counts, Utc::now())
            .await?
        {
            return Err(ServiceError::InvalidTransition {
                entity: "engagement",
                id: engagement_id,
                from: "fraud_flagged".to_string(),
                to: "rescored".to_string(),
            });
        }
        warn!(
            engagement_id = %engagement_id,
            previous = ?engagement.validation_score,
            %score,
            counts_for_payout = counts,
            "Engagement score recalculated by admin"
        );
        Ok(self.store.get_engagement(engagement_id).await?)
    }

    pub async fn user_analytics(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> ServiceResult<UserEngagementAnalytics> {
        let rows = self
            .store
            .list_engagements(&EngagementQuery {
                user_id: Some(user_id),
                course_id: None,
                started_from: from,
                started_before: before,
            })
            .await?;
        let unique_courses = rows.iter().map(|e| e.course_id).collect::<BTreeSet<_>>().len();
        Ok(UserEngagementAnalytics {
            user_id,
            unique_courses: to_u32(unique_courses as i64),
            totals: totals(&rows),
        })
    }

    pub async fn course_analytics(
        &self,
        course_id: Uuid,
        from: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> ServiceResult<CourseEngagementAnalytics> {
        let rows = self
            .store
            .list_engagements(&EngagementQuery {
                user_id: None,
                course_id: Some(course_id),
                started_from: from,
                started_before: before,
            })
            .await?;
        let unique_users = rows.iter().map(|e| e.user_id).collect::<BTreeSet<_>>().len();
        Ok(CourseEngagementAnalytics {
            course_id,
            unique_users: to_u32(unique_users as i64),
            totals: totals(&rows),
        })
    }

    /// Qualifying minutes per course for one instructor in one period.
    pub async fn instructor_breakdown(
        &self,
        instructor_id: Uuid,
        period: AccountingPeriod,
    ) -> ServiceResult<InstructorAttribution> {
        let rows = self.store.qualifying_minutes(period.start(), period.end()).await?;
        let course_ids: Vec<Uuid> = rows.iter().map(|r| r.course_id).collect::<BTreeSet<_>>().into_iter().collect();
        let owners = self.catalog.course_owners(&course_ids).await?;
        Ok(attribute_to_instructors(&rows, &owners)
            .remove(&instructor_id)
            .unwrap_or_default())
    }

    pub async fn fraud_statistics(
        &self,
        from: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> ServiceResult<FraudStatistics> {
        let rows = self.all_in_range(from, before).await?;
        let mut stats = FraudStatistics {
            total: to_u32(rows.len() as i64),
            ..Default::default()
        };
        for e in &rows {
            if e.counts_for_payout {
                stats.validated += 1;
            }
            if e.fraud_flagged {
                stats.flagged += 1;
            }
            match e.validation_score {
                None => stats.pending += 1,
                Some(score) if !e.fraud_flagged && score < self.config.suspicious_threshold => {
                    stats.suspicious += 1
                }
                Some(_) => {}
            }
        }
        stats.average_score = average_score(&rows);
        if stats.total > 0 {
            stats.fraud_rate = (Decimal::from(stats.flagged) / Decimal::from(stats.total))
                .round_dp_with_strategy(fraud::SCORE_SCALE, RoundingStrategy::MidpointAwayFromZero);
        }
        Ok(stats)
    }

    /// Unflagged records that need an admin's eye: scored below the
    /// suspicious threshold, or still counting with a score under the
    /// current fraud threshold.
    pub async fn detect_suspicious(
        &self,
        from: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> ServiceResult<Vec<Engagement>> {
        let rows = self.all_in_range(from, before).await?;
        Ok(rows
            .into_iter()
            .filter(|e| !e.fraud_flagged)
            .filter(|e| match e.validation_score {
                Some(score) => {
                    score < self.config.suspicious_threshold
                        || (e.counts_for_payout && score < self.config.fraud.threshold)
                }
                None => false,
            })
            .collect())
    }

    async fn all_in_range(&self, from: DateTime<Utc>, before: DateTime<Utc>) -> ServiceResult<Vec<Engagement>> {
        Ok(self
            .store
            .list_engagements(&EngagementQuery {
                user_id: None,
                course_id: None,
                started_from: from,
                started_before: before,
            })
            .await?)
    }

    async fn fingerprint_status(&self, engagement: &Engagement) -> ServiceResult<FingerprintStatus> {
        match engagement.metadata.device_fingerprint.as_deref().map(str::trim) {
            None | Some("") => Ok(FingerprintStatus::Absent),
            Some(fp) => {
                let seen = self
                    .store
                    .fingerprint_seen(engagement.user_id, fp, engagement.started_at)
                    .await?;
                Ok(if seen {
                    FingerprintStatus::Consistent
                } else {
                    FingerprintStatus::Unseen
                })
            }
        }
    }

    fn check_duration(&self, minutes: i64) -> ServiceResult<u32> {
        if minutes < 0 {
            return Err(invalid(format!("Duration must not be negative, got {}", minutes)));
        }
        if minutes > i64::from(self.config.max_session_minutes) {
            return Err(invalid(format!(
                "Duration of {} minutes exceeds the maximum of {}",
                minutes, self.config.max_session_minutes
            )));
        }
        u32::try_from(minutes).map_err(|_| invalid("Duration out of range"))
    }
}

fn engagement_state(engagement: &Engagement) -> &'static str {
    if engagement.fraud_flagged {
        "fraud_flagged"
    } else if engagement.validation_score.is_some() {
        "scored"
    } else if engagement.completed_at.is_some() {
        "completed"
    } else {
        "open"
    }
}

fn check_signals(signals: &SessionSignals) -> ServiceResult<()> {
    let finite = |name: &str, value: Option<f64>| -> ServiceResult<()> {
        match value {
            Some(v) if !v.is_finite() => Err(invalid(format!("Signal {} must be a finite number", name))),
            _ => Ok(()),
        }
    };
    finite("tab_active_ratio", signals.tab_active_ratio)?;
    finite("playback_speed", signals.playback_speed)?;
    finite("session_seconds", signals.session_seconds)?;
    finite("content_seconds", signals.content_seconds)?;

    if let Some(ratio) = signals.tab_active_ratio {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(invalid(format!("tab_active_ratio must be within [0, 1], got {}", ratio)));
        }
    }
    for (name, value) in [
        ("playback_speed", signals.playback_speed),
        ("session_seconds", signals.session_seconds),
        ("content_seconds", signals.content_seconds),
    ] {
        if let Some(v) = value {
            if v <= 0.0 {
                return Err(invalid(format!("{} must be positive, got {}", name, v)));
            }
        }
    }
    Ok(())
}

fn totals(rows: &[Engagement]) -> EngagementTotals {
    let mut totals = EngagementTotals {
        total_engagements: to_u32(rows.len() as i64),
        ..Default::default()
    };
    for e in rows {
        let minutes = i64::from(e.duration_minutes);
        totals.total_minutes += minutes;
        if e.counts_for_payout {
            totals.validated_engagements += 1;
            totals.validated_minutes += minutes;
        }
        *totals.minutes_by_type.entry(e.engagement_type).or_default() += minutes;
    }
    totals.average_score = average_score(rows);
    totals
}

fn average_score(rows: &[Engagement]) -> Option<Decimal> {
    let scores: Vec<Decimal> = rows.iter().filter_map(|e| e.validation_score).collect();
    if scores.is_empty() {
        return None;
    }
    let sum: Decimal = scores.iter().sum();
    Some(
        (sum / Decimal::from(scores.len() as u64))
            .round_dp_with_strategy(fraud::SCORE_SCALE, RoundingStrategy::MidpointAwayFromZero),
    )
}
