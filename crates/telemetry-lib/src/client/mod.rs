//! Client side of the telemetry pipeline
//!
//! Events flow from the [`EventCollector`] through the
//! [`DeliveryStrategySelector`]; whatever cannot be delivered lands in the
//! [`OfflineQueue`] and is replayed by the [`FlushManager`]. The
//! [`TelemetryPipeline`] actor ties them together.

pub mod blocker;
pub mod collector;
pub mod delivery;
pub mod flush;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod transport;

pub use blocker::{BaitResourceProbe, BlockerDetector, BlockerProbe, StaticProbe};
pub use collector::{CollectorConfig, CollectorState, EventCollector};
pub use delivery::{
    AttemptState, DeliveryConfig, DeliveryOutcome, DeliveryStrategySelector, StrategyDescriptor,
    StrategyKind,
};
pub use flush::{DeliveryVerifier, FlushConfig, FlushManager, FlushReport, FlushTrigger, HttpVerifier};
pub use pipeline::{PipelineConfig, PipelineHandle, PipelineStats, TelemetryPipeline, UnloadReport};
pub use queue::{BackoffPolicy, OfflineQueue, QueueConfig, QueueStats};
pub use store::{DurableQueueStore, FileQueueStore, MemoryQueueStore};
pub use transport::{
    BeaconTransport, BestEffortTransport, HttpTransport, LoopbackBeacon, LoopbackTransport,
    Transport,
};
