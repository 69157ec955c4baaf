//! The three primary datafile sources: streaming, polling, and bundled.
//!
//! Sources never mutate Controller state directly — they perform I/O and
//! emit [`crate::core::SourceEvent`]s (or, for one-shot operations, return
//! a result directly) for the Controller to apply through its
//! `is_newer_data` guard.

pub mod bundled;
pub mod fetch;
pub mod polling;
pub mod stream;

pub use bundled::{BundledLookup, BundledSource, InMemoryBundledRegistry};
pub use fetch::fetch_datafile;
pub use polling::PollingSource;
pub use stream::StreamSource;
