//! Playback Module - Ausgabe eingehender Agent-Audiodaten
//!
//! - Ausgabe-Kontext mit gemeinsamer Uhr (cpal)
//! - Lückenloses Scheduling und Barge-in

mod output;
mod scheduler;

pub use output::{AudioError, AudioOutput, SourceId, SpeakerOutput};
pub use scheduler::{PlaybackScheduler, ScheduledSource};
