//! Client core for live-proctored exams: signaling, peer media, the
//! candidate lockdown state machine, and automated frame analysis.

pub mod analysis;
pub mod api;
pub mod config;
pub mod error;
pub mod media;
pub mod proctor;
pub mod room;
pub mod signaling;
pub mod timer;

#[cfg(test)]
mod testing;

pub use error::{ProctorError, Result};
