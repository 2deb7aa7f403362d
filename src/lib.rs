//! Library crate for bleed-scan-rs exposing the scan pipeline and its collaborators.
pub mod classify;
pub mod heartbleed;
pub mod probe;
pub mod scanner;
pub mod targets;
pub mod types;
