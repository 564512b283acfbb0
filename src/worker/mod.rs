//! Worker runtime: pulls jobs from a coordinator and streams completions back.
//!
//! - `transport`: claim/heartbeat/submit calls, in-process or over HTTP
//! - `source`: where completion text comes from
//! - `chunker`: debounces streamed tokens into partial submissions
//! - `backoff`: local retry schedule for failed generations
//! - `runner`: the wait → claim → generate → report loop

pub mod backoff;
pub mod chunker;
pub mod runner;
pub mod source;
pub mod transport;

pub use chunker::ChunkBuffer;
pub use runner::WorkerRunner;
pub use source::{CompletionSource, CompletionStream};
pub use transport::{HttpTransport, LocalTransport, WorkerTransport};
