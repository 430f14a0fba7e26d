//! The connection pool's contract (spec.md §6 "Pool listener contract").
//! The pool itself — checkout, eviction policy, connection creation — is
//! out of scope (§1); only the two notifications `LifecycleController` and
//! `ConnectionFacade` emit into it live here.

/// Notified by `LifecycleController`/`ConnectionFacade` as a connection
/// moves through recycle/evict/close.
pub trait PoolListener: Send + Sync {
    /// The connection is idle and reusable; the pool may check it out again.
    fn on_recycle(&self) {}

    /// The connection must not be checked out again (shutdown initiated, or
    /// a fatal error occurred). The connection may still be finishing
    /// in-flight work.
    fn on_evict(&self) {}
}

/// A `PoolListener` that does nothing, for callers that don't pool
/// connections themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPoolListener;

impl PoolListener for NoopPoolListener {}
