use std::fmt;

use thiserror::Error;

use quill_types::SessionId;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Any store operation before `init()` completed. A programming error.
    #[error("message store used before init() completed")]
    NotInitialized,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    /// Persisting a session's batch failed after all retries. The batch is
    /// back in the write buffer.
    #[error("flush failed for session {session_id}: {error:#}")]
    FlushFailed {
        session_id: SessionId,
        error: anyhow::Error,
    },
    /// One or more sessions failed during a flush of every session. The
    /// other sessions were still flushed.
    #[error("flush failed for {} session(s): {}", .failures.len(), FlushFailures(.failures))]
    FlushAll { failures: Vec<(SessionId, String)> },
    #[error("remote backend error: {0:#}")]
    Backend(anyhow::Error),
}

struct FlushFailures<'a>(&'a [(SessionId, String)]);

impl fmt::Display for FlushFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (session_id, message)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{session_id}: {message}")?;
        }
        Ok(())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
