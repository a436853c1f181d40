pub mod config; // engine and gateway configuration
pub mod endpoints; // HTTP surface for quota status and subscription resume
pub mod error; // error handling
pub mod quota; // decision engine, execution gate, status projection
pub mod redis_client; // redis client
pub mod singleflight; // keyed deduplication of in-flight operations
pub mod subscription; // subscription read model and oracle
pub mod usage; // usage records, history, and the durable counter store

pub use config::{Config, QuotaConfig};
pub use error::{Error, ErrorDetails};
pub use quota::{
    ExecutionGate, ExecutionOutcome, QuotaDecision, QuotaEngine, QuotaLimit, StatusProjector,
};
pub use subscription::{SubscriptionOracle, SubscriptionView};
pub use usage::{UsageRecord, UsageRecordStore};
