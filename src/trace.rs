//! Per-request correlation ids.
//!
//! [`request_context`] opens a tracing span carrying a fresh correlation id;
//! every log line emitted while the guard is alive inherits it, so a single
//! request can be followed across the generator, validator and executor.

use tracing::{Span, info_span};
use uuid::Uuid;

/// Unique identifier attached to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scoped request context. Dropping it closes the span.
pub struct RequestGuard {
    id:   RequestId,
    span: Span
}

impl RequestGuard {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The span to instrument async work with.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Open a correlation scope for one request.
pub fn request_context() -> RequestGuard {
    let id = RequestId::new();
    let span = info_span!("request", request_id = %id);
    RequestGuard {
        id,
        span
    }
}
