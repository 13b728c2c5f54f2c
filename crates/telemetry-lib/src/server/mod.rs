//! Server side of the telemetry pipeline: admission, de-duplication,
//! storage handoff and performance analysis

pub mod admin;
pub mod analyzer;
pub mod dedup;
pub mod gate;
pub mod limiter;
pub mod storage;

pub use admin::{
    AdminAuthorizer, AdminReport, AdminService, ApplyRequest, ApplyResult, DenyAll,
    StaticTokenAuthorizer,
};
pub use analyzer::{AnalyzerConfig, Classification, EndpointStats, PerformanceAnalyzer, Recommendation};
pub use dedup::RecentIdCache;
pub use gate::{
    ClientIdentity, GateConfig, IngestRequest, IngestResponse, IngestionGate, KeyStrategy,
};
pub use limiter::{AdmissionDecision, LimiterStats, LimiterTable, RateLimiter};
pub use storage::{ConversionSummary, EventStore, JsonlEventStore, MemoryEventStore};
