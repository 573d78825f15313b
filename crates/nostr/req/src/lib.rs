//! `nostr-req`: query Nostr relays from the command line.
//!
//! Filters are built from flags, optionally merged into JSON filters read from stdin
//! (one per line). With relay addresses the matching events are printed as JSON lines;
//! without them the filter itself is printed.

pub mod cli;
pub mod config;
pub mod context;
pub mod input;
pub mod output;
pub mod run;
pub mod time;

pub use cli::Args;
pub use config::ReqConfig;
pub use context::ReqContext;
pub use input::InputLines;
pub use output::Output;
pub use run::{EXIT_FAILURE, EXIT_NO_RELAYS, Report, execute, exit_code_for, run};
