pub mod docker;
pub mod overlay;
mod services;
mod state;
mod transcripts;
pub mod uplink;

pub use services::Services;
pub use state::{SessionState, State};
pub use transcripts::{SessionTranscripts, TranscriptError, TranscriptWriter};
