pub mod cloud;
pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod frame;
pub mod handler;
pub mod mode;
pub mod publish;
pub mod queue;
pub mod server;
pub mod shutdown;
pub mod stats;
pub mod synth;


// Re-export codec types for direct access
pub use codec::{CodecError, build_frame, checksum};
pub use frame::{Frame, FrameClass, PollKind};

// Re-export the main service handles for easy access
pub use cloud::{CloudSession, SendOutcome, SessionState};
pub use config::Config;
pub use control::{ControlPipeline, SettingState};
pub use mode::{Mode, ModeEngine};
pub use publish::{ControlRequest, ControlStatus, ControlUpdate, Direction, Event, FrameSink};
pub use queue::DurableQueue;
pub use stats::Stats;

/// Error returned by most functions.
///
/// Layer-local failures use dedicated `thiserror` enums (`CodecError`,
/// `QueueError`, `ControlError`) or explicit outcome values
/// (`SendOutcome`) because those are hit and handled during normal
/// execution. At the plumbing seams a boxed `std::error::Error` is
/// sufficient and keeps signatures short.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for proxy operations.
///
/// This is defined as a convenience.
pub type Result<T> = std::result::Result<T, Error>;
