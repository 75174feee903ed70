//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use revshare_core::ports::{
    ConnectAccountDirectory, CourseCatalog, EngagementStore, PayoutStore, RevenueStore,
    SubscriptionDirectory, TransferProvider,
};
use revshare_core::{EngagementService, PayoutCalculator, PayoutExecutor, RevenueLedger};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engagements: Arc<EngagementService>,
    pub ledger: Arc<RevenueLedger>,
    pub calculator: Arc<PayoutCalculator>,
    pub executor: Arc<PayoutExecutor>,
    pub config: Arc<Config>,
    /// False when no transfer API key is configured; execution is refused.
    pub transfers_enabled: bool,
}

impl AppState {
    /// Wires every core service over one store that implements all the
    /// storage and directory ports.
    pub fn new<S>(store: Arc<S>, provider: Arc<dyn TransferProvider>, config: Arc<Config>) -> Self
    where
        S: EngagementStore
            + RevenueStore
            + PayoutStore
            + CourseCatalog
            + ConnectAccountDirectory
            + SubscriptionDirectory
            + 'static,
    {
        let engagements = Arc::new(EngagementService::new(
            store.clone(),
            store.clone(),
            config.engagement_config(),
        ));
        let ledger = Arc::new(RevenueLedger::new(store.clone(), store.clone()));
        let calculator = Arc::new(PayoutCalculator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            config.payout_config(),
        ));
        let executor = Arc::new(PayoutExecutor::new(
            store.clone(),
            store,
            provider,
            config.executor_config(),
        ));

        Self {
            engagements,
            ledger,
            calculator,
            executor,
            transfers_enabled: config.transfer_api_key.is_some(),
            config,
        }
    }
}
