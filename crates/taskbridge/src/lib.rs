//! taskbridge: IPC execution bridge between a supervising process and an agent task engine.

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod engine;
mod logging;
pub mod manager;
mod multiplexer;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod transport;

/// Bridge version reported in the readiness pong.
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use adapter::EngineAdapter;
pub use bridge::protocol::{
    Artifact, ArtifactKind, Envelope, ExecutionRequest, ExecutionResponse, ExecutionStatus,
    LogEntry, LogLevel, ResourceLimits, ResourceUsage,
};
pub use config::{BridgeConfig, ConfigError, EngineConfig};
pub use engine::{
    CommandEngine, EngineError, EngineEvent, EngineEvents, EngineSession, ExecutionEngine,
    LaunchMode, SessionConfig,
};
pub use logging::init_tracing;
pub use manager::SessionManager;
pub use service::{BridgeService, ShutdownOutcome};
pub use session::{SessionError, SessionSnapshot, SessionState};
pub use shutdown::{ShutdownCoordinator, ShutdownReason, install_panic_hook, termination_signal};
