//! Storefront telemetry pipeline
//!
//! This crate provides:
//! - A client pipeline that batches events, survives tracker blocking and
//!   keeps undelivered events in a durable offline queue
//! - An ingestion gate with sliding-window rate limiting and de-duplication
//! - A performance analyzer that recommends, but never applies, new limits
//! - Health checks and observability

pub mod client;
pub mod clock;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod server;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{PipelineError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
