pub mod frame;
pub mod rewrite;
pub mod sse;
pub mod supervisor;

pub use supervisor::{
    process_stream, ClientSink, ContinuationFailure, SupervisorError, SupervisorSettings,
};

use std::fmt;

/// Why a stream attempt stopped before a clean exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionReason {
    /// The upstream closed the stream without a finish reason.
    Drop,
    /// A safety block was signalled mid-stream.
    Block,
    /// A finish reason arrived on a thought chunk.
    FinishDuringThought,
    /// `STOP` with no accumulated text at all.
    FinishEmptyResponse,
    /// `STOP` without the trailing completion marker.
    FinishIncomplete,
    /// A finish reason outside the accepted set.
    FinishAbnormal,
    /// A data frame whose candidates structure is corrupt.
    InvalidCandidates,
}

impl InterruptionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            InterruptionReason::Drop => "DROP",
            InterruptionReason::Block => "BLOCK",
            InterruptionReason::FinishDuringThought => "FINISH_DURING_THOUGHT",
            InterruptionReason::FinishEmptyResponse => "FINISH_EMPTY_RESPONSE",
            InterruptionReason::FinishIncomplete => "FINISH_INCOMPLETE",
            InterruptionReason::FinishAbnormal => "FINISH_ABNORMAL",
            InterruptionReason::InvalidCandidates => "INVALID_CANDIDATES",
        }
    }
}

impl fmt::Display for InterruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
