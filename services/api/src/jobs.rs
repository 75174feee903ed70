//! services/api/src/jobs.rs
//!
//! Periodic background work: the Batch Validator and the payout
//! claim/execute cycle. Each job is a tokio task that ticks on an interval
//! and exits when its `CancellationToken` is cancelled.

use std::sync::Arc;
use std::time::Duration;

use revshare_core::{EngagementService, PayoutExecutor};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Scores pending engagements in bounded batches until cancelled.
pub fn spawn_validation_job(
    engagements: Arc<EngagementService>,
    batch_size: usize,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(?every, batch_size, "Validation job started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Keep draining while full batches come back, so a backlog does
            // not wait a whole interval per batch. Only applied scores count,
            // and a pass with none made no progress.
            loop {
                match engagements.validate_pending(None, batch_size).await {
                    Ok(n) if n > 0 && n == batch_size && !token.is_cancelled() => continue,
                    Ok(_) => break,
                    Err(e) => {
                        error!("Validation batch failed: {:?}", e);
                        break;
                    }
                }
            }
        }
        info!("Validation job stopped");
    })
}

/// Claims eligible pending payouts, then executes the claimed ones, until cancelled.
pub fn spawn_payout_job(
    executor: Arc<PayoutExecutor>,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(?every, "Payout job started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = executor.process_pending_payouts().await {
                error!("Claiming pending payouts failed: {:?}", e);
                continue;
            }
            if token.is_cancelled() {
                break;
            }
            if let Err(e) = executor.execute_processing_payouts().await {
                error!("Executing claimed payouts failed: {:?}", e);
            }
        }
        info!("Payout job stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use revshare_core::domain::{EngagementMetadata, EngagementType, SessionSignals};
    use revshare_core::ports::EngagementStore;
    use revshare_core::{EngagementConfig, EngagementReport, InMemoryStore, SessionCompletion};
    use uuid::Uuid;

    #[tokio::test]
    async fn validation_job_scores_backlog_and_stops_on_cancel() {
        let store = Arc::new(InMemoryStore::new());
        let service = Arc::new(EngagementService::new(
            store.clone(),
            store.clone(),
            EngagementConfig::default(),
        ));

        let mut ids = Vec::new();
        for _ in 0..5 {
            let started_at = Utc::now() - ChronoDuration::minutes(30);
            let recorded = service
                .record_engagement(EngagementReport {
                    user_id: Uuid::new_v4(),
                    course_id: Uuid::new_v4(),
                    lesson_id: None,
                    engagement_type: EngagementType::VideoWatch,
                    duration_minutes: 20,
                    started_at,
                    completed_at: None,
                    metadata: EngagementMetadata::default(),
                })
                .await
                .unwrap();
            service
                .complete_session(
                    recorded.id,
                    SessionCompletion {
                        completed_at: started_at + ChronoDuration::minutes(20),
                        duration_minutes: None,
                        signals: SessionSignals {
                            tab_active_ratio: Some(1.0),
                            playback_speed: Some(1.0),
                            session_seconds: Some(1200.0),
                            content_seconds: Some(1200.0),
                        },
                    },
                )
                .await
                .unwrap();
            ids.push(recorded.id);
        }

        let token = CancellationToken::new();
        let handle = spawn_validation_job(service, 2, Duration::from_millis(10), token.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();

        for id in ids {
            let engagement = store.get_engagement(id).await.unwrap();
            assert!(!engagement.is_pending(), "engagement {} left pending", id);
        }
    }

    #[tokio::test]
    async fn validation_job_with_empty_batches_still_stops() {
        let store = Arc::new(InMemoryStore::new());
        let service = Arc::new(EngagementService::new(
            store.clone(),
            store.clone(),
            EngagementConfig::default(),
        ));

        let token = CancellationToken::new();
        let handle = spawn_validation_job(service, 0, Duration::from_millis(10), token.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("validation job kept spinning")
            .unwrap();
    }
}
