//! On-disk artifact layout for runs:
//! `<root>/<run_id>/{metadata.json, events.jsonl, pcaps/<run_id>.pcap}`.

mod open;
mod models;
mod insert;
mod query;

pub use open::{RunPaths, RunStore};
pub use models::*;
pub use insert::{digest_file, EventLog};
