//! # Error Taxonomy
//!
//! Engine errors are classified by *kind*, not by source type, because the
//! run lifecycle reacts to the class: configuration and capability errors
//! abort setup, backend errors are recorded per-operation and swallowed,
//! guardrail breaches and cancellations steer the state machine.
//!
//! | Variant | Raised | Effect on the run |
//! |---------|--------|-------------------|
//! | `Configuration` | at setup | never leaves PREPARED |
//! | `Capability` | at setup (weight > 0) or per-op | setup failure / recorded error |
//! | `TransientBackend` | per operation | recorded, run continues |
//! | `PoolExhausted` | per operation | recorded, worker backs off and retries |
//! | `Profile` | at setup | degrades capability, fatal only if nothing can run |
//! | `Guardrail` | controller tick | STOPPING → FAILED |
//! | `Cancelled` | external stop | STOPPING → CANCELLED |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid template: bad weights, missing SQL, identifier violations,
    /// concurrency above the hard ceiling.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An enabled kind cannot execute with the available profile and pools
    /// (e.g. UPDATE with no key pool and no id bounds).
    #[error("capability error: {0}")]
    Capability(String),

    /// Connection acquire or query execution failure. Recorded against the
    /// operation; never fails the run.
    #[error("backend error: {0}")]
    TransientBackend(String),

    /// The connection pool had no free slot. Workers back off (capped at
    /// 50 ms) and retry the same operation slot.
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// DESCRIBE / MIN-MAX profiling failed. The run degrades rather than
    /// aborting unless no kind can execute at all.
    #[error("profile error: {0}")]
    Profile(String),

    /// A resource ceiling was exceeded. The message names the metric and
    /// threshold that tripped.
    #[error("guardrail breached: {0}")]
    Guardrail(String),

    /// External stop request observed.
    #[error("cancellation requested")]
    Cancelled,
}

impl EngineError {
    /// True for errors a worker records and survives.
    pub fn is_per_operation(&self) -> bool {
        matches!(
            self,
            EngineError::TransientBackend(_)
                | EngineError::PoolExhausted(_)
                | EngineError::Capability(_)
        )
    }
}
