//! The composition root: wires the Queue Subsystem and the Parallel
//! Processing Subsystem together behind a single `Platform` that owns
//! startup, background services, and graceful shutdown.

pub mod context;
pub mod runtime;
pub mod service;
pub mod services;
pub mod telemetry;

pub use context::PlatformContext;
pub use runtime::{Platform, PlatformRuntime};
pub use service::ServiceRegistration;
