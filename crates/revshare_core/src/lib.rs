pub mod domain;
pub mod engagement;
pub mod error;
pub mod executor;
pub mod fraud;
pub mod memory;
pub mod payout;
pub mod ports;
pub mod revenue;

pub use domain::{
    AccountingPeriod, Engagement, EngagementType, InstructorConnectAccount, InstructorPayout,
    PayoutStatus, RevenueStatus, SubscriptionRevenue,
};
pub use engagement::{EngagementConfig, EngagementReport, EngagementService, SessionCompletion};
pub use error::{ServiceError, ServiceResult};
pub use executor::{ExecutionOutcome, ExecutorConfig, PayoutExecutor};
pub use fraud::FraudConfig;
pub use memory::InMemoryStore;
pub use payout::{PayoutCalculator, PayoutConfig};
pub use ports::{
    ConnectAccountDirectory, CourseCatalog, EngagementStore, PayoutStore, PortError, PortResult,
    RevenueStore, SubscriptionDirectory, TransferProvider,
};
pub use revenue::{RecordOutcome, RevenueLedger};
