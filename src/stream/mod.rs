//! Streaming module
//!
//! Download scheduling for a single content item: chunk ordering, session
//! lifecycle and the playback hand-off.

pub mod order;
pub mod playback;
pub mod scheduler;
pub mod session;

pub use order::{first_pass_order, repair_order, session_rng, FaultInjection};
pub use playback::{CommandPlayback, NoPlayback, PlaybackHook};
pub use scheduler::{SessionHandle, StreamConfig, StreamManager};
pub use session::{SessionReport, SessionState, Source, StreamRequest};
