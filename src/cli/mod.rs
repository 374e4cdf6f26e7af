//! Command-line interface for lyricforge.
//!
//! Provides commands for running lyric-fetch batches and inspecting the
//! result store.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
