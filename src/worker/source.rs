//! Where a worker's completions come from.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::LlmError;
use crate::jobs::ClaimedJob;

/// Streamed completion text.
pub type CompletionStream = BoxStream<'static, Result<String, LlmError>>;

/// Produces completion text for a claimed job.
///
/// Implementations resolve the job's conversation context themselves; the
/// dispatcher only hands out the target output.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Provider name for logs and errors.
    fn name(&self) -> &str;

    /// Open a stream of text parts for `job`.
    async fn stream(&self, job: &ClaimedJob) -> Result<CompletionStream, LlmError>;
}
