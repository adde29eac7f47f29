//! A simple crate reading a batch of network resources concurrently.
//!
//! Resources are named by opaque identifiers (usually URLs) and fetched by a bounded pool of workers, the outcomes being
//! returned in the very same order as the identifiers whatever the order workers complete in.
//!
//! Two reading modes are provided on purpose, with different error policies:
//! - [`Reader::read()`] fetches with a pool and collects every outcome: a failing resource only fails its own [`Outcome`],
//!   only an empty input fails the whole read;
//! - [`UrlReader::read_sequentially()`] fetches one resource at a time and stops at the first failure.
//!
//! Workers all pull tasks from one shared channel, so that a slow resource only holds its own worker back. Outcomes are written
//! to a shared [`ResultStore`] whose lock covers both the slot write and the pending count, and the write completing the last
//! pending slot wakes the dispatcher up to stop the pool.
//!
//! Actual fetching is delegated to a [`Fetch`](download::Fetch) implementor, [`HttpFetcher`](download::HttpFetcher) by default.

mod error;
pub use error::*;

mod outcome;
pub use outcome::*;

mod reader;
pub use reader::*;

pub mod download;
pub mod task;

pub use bytes;
