//! Async access to the blocking SQLite handle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arogya_shared::ChatError;
use arogya_store::Database;

use crate::error::ServerError;

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Shared database handle. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct SharedDb {
    inner: Arc<Mutex<Database>>,
}

impl SharedDb {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> arogya_store::Result<T> + Send + 'static,
    {
        self.run(None, f).await
    }

    /// Like [`call`](Self::call), but gives up if the database cannot be
    /// reached before `deadline`, even while another call holds it.
    ///
    /// The closure either runs to completion or not at all. A caller that
    /// times out marks the queued task abandoned so it never starts later;
    /// if the task won the race and already started, its result is awaited
    /// and reported instead.
    pub async fn call_before<T, F>(&self, deadline: Instant, f: F) -> Result<T, ServerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> arogya_store::Result<T> + Send + 'static,
    {
        self.run(Some(deadline), f).await
    }

    async fn run<T, F>(&self, deadline: Option<Instant>, f: F) -> Result<T, ServerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> arogya_store::Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        let claim = Arc::new(AtomicU8::new(PENDING));
        let task_claim = claim.clone();

        let mut task = tokio::task::spawn_blocking(move || {
            let mut db = inner
                .lock()
                .map_err(|_| ServerError::Internal("database mutex poisoned".into()))?;

            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if expired
                || task_claim
                    .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return Err(timed_out());
            }

            f(&mut db).map_err(ServerError::from)
        });

        let joined = match deadline {
            None => task.await,
            Some(deadline) => {
                let at = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(at, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        let abandon = claim.compare_exchange(
                            PENDING,
                            ABANDONED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        if abandon.is_ok() {
                            return Err(timed_out());
                        }
                        task.await
                    }
                }
            }
        };

        joined.map_err(|e| ServerError::Internal(format!("database task failed: {e}")))?
    }
}

fn timed_out() -> ServerError {
    ChatError::DeliveryFailed("persistence timed out".into()).into()
}
