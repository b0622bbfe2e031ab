//! Error type surfaced through shared task futures
//!
//! Task outcomes are observed by every caller attached to a coalesced
//! submission, so the error must be cheap to clone; it carries messages,
//! not sources.

use miette::Diagnostic;
use thiserror::Error;

/// Failure of a queued task
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum TaskError {
    /// The task body (a registered user function) failed
    #[error("Item '{item}' failed: {message}")]
    #[diagnostic(code(tracelens::queue::item_failed))]
    Failed {
        /// Name of the item whose task failed
        item: String,
        /// Failure message
        message: String,
    },

    /// The queue itself could not run or settle the task
    #[error("Scheduling error: {message}")]
    #[diagnostic(
        code(tracelens::queue::scheduling),
        help("Scheduling failures are recorded as failed completions, never panics")
    )]
    Scheduling {
        /// What went wrong inside the queue machinery
        message: String,
    },
}

impl TaskError {
    /// Create an item-failure error
    #[must_use]
    pub fn failed(item: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            item: item.into(),
            message: message.into(),
        }
    }

    /// Create a scheduling error
    #[must_use]
    pub fn scheduling(message: impl Into<String>) -> Self {
        Self::Scheduling {
            message: message.into(),
        }
    }
}
