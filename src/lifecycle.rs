//! Component E: `LifecycleController` (spec.md §4.E). Decides recycle vs.
//! close after each exchange and drives shutdown with an optional grace
//! period.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::connection::ConnectionInner;
use crate::error::{Error, Result};

/// Runs after any exchange completion (spec.md §4.E).
pub(crate) async fn check(conn: &Arc<ConnectionInner>) {
    if conn.close_after_current.load(Ordering::Acquire) {
        conn.close().await;
    } else {
        recycle(conn).await;
    }
}

pub(crate) async fn recycle(conn: &Arc<ConnectionInner>) {
    if conn.shutdown.load(Ordering::Acquire) && conn.queues.is_empty() {
        conn.close().await;
        return;
    }
    if conn.is_tunnel.load(Ordering::Acquire) {
        return;
    }
    let timeout = conn.keep_alive_timeout_seconds.load(Ordering::Acquire);
    let expiration = if timeout == 0 {
        0
    } else {
        ConnectionInner::now_epoch_seconds() + timeout
    };
    conn.expiration_timestamp.store(expiration, Ordering::Release);
    trace!(expiration, "connection recycled");
    conn.pool.on_recycle();
}

pub(crate) fn is_valid(conn: &Arc<ConnectionInner>) -> bool {
    let expiration = conn.expiration_timestamp.load(Ordering::Acquire);
    expiration == 0 || ConnectionInner::now_epoch_seconds() <= expiration
}

/// `shutdown(timeout_ms)` (spec.md §4.E). The returned future resolves when
/// the connection has actually closed, mirroring the source's "completion
/// promise fired on connection close".
pub(crate) async fn shutdown(conn: &Arc<ConnectionInner>, timeout: Option<Duration>) -> Result<()> {
    if conn.shutdown.swap(true, Ordering::AcqRel) {
        return Err(Error::new_already_shutdown());
    }
    debug!(?timeout, "shutdown requested");

    let (tx, rx) = oneshot::channel();
    conn.shutdown_waiters.lock().unwrap().push(tx);
    conn.pool.on_evict();

    if !conn.closed.load(Ordering::Acquire) {
        match timeout {
            Some(d) if !d.is_zero() => {
                let generation = conn.shutdown_timer_generation.fetch_add(1, Ordering::AcqRel) + 1;
                let timer_conn = Arc::clone(conn);
                tokio::spawn(async move {
                    tokio::time::sleep(d).await;
                    if timer_conn.shutdown_timer_generation.load(Ordering::Acquire) == generation {
                        timer_conn.close().await;
                    }
                });
            }
            _ => {
                conn.close_after_current.store(true, Ordering::Release);
            }
        }
        check(conn).await;
    }

    let _ = rx.await;
    Ok(())
}
