//! # Frame Concentrator
//!
//! Real-time measurement concentrator. Accepts an unordered, multi-source
//! stream of timestamped samples and re-emits them as fixed-rate frames, each
//! holding every sample whose timestamp falls into the frame's time slice.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   sort_measurements   ┌────────────────────────────────┐
//! │  Producers   │ ────────────────────▶ │          Concentrator          │
//! │ (N threads)  │                       │  real-time ─▶ classify ─▶ sort │
//! └──────────────┘                       │                 │              │
//!                                        │          ┌──────▼──────┐       │
//!                                        │          │ Frame Queue │       │
//!                                        │          └──────┬──────┘       │
//!                                        │   publisher     │  monitor     │
//!                                        └─────────────────┼──────────────┘
//!                                                          ▼
//!                                                   FrameHandler::publish_frame
//! ```

// ============================================================================
// SECTION 1: CRATE ROOT
// ============================================================================

pub mod clock;
pub mod concentrator;
pub mod config;
pub mod error;
pub mod frame;
pub mod frame_queue;
pub mod immediate;
pub mod logging;
pub mod measurement;
pub mod observer;
pub mod scheduler;
pub mod stats;
pub mod ticks;

use std::time::Duration;

pub use clock::{ClockPolicy, LocalClock, RealTimeReference};
pub use concentrator::{Concentrator, ConcentratorBuilder, FrameHandler};
pub use config::{ConcentratorConfig, EngineConfig, LoggingConfig, SimulationConfig};
pub use error::{ConcentratorError, ConcentratorResult, ConfigError, ConfigResult, PublishError};
pub use frame::Frame;
pub use frame_queue::FrameQueue;
pub use immediate::ImmediateMeasurements;
pub use logging::init_logging;
pub use measurement::{Measurement, MeasurementKey, TemporalMeasurement};
pub use observer::{ChannelObserver, ConcentratorEvent, ConcentratorObserver, NoopObserver};
pub use scheduler::{wait_periods, FrameRateTimer};
pub use stats::StatsSnapshot;
pub use ticks::{FrameRate, Ticks};

// ----------------------------------------------------------------------------
// 1.1 Constants
// ----------------------------------------------------------------------------

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

pub const DEFAULT_FRAMES_PER_SECOND: u32 = 30;

/// Seconds
pub const DEFAULT_LAG_TIME: f64 = 3.0;

/// Seconds
pub const DEFAULT_LEAD_TIME: f64 = 1.0;

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "CONCENTRATOR_";
