use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Spawns tasks immediately but lets at most `max_concurrent` of them run their
/// body at once. Waiting tasks queue on the semaphore in FIFO order.
pub struct LimitedSpawner {
    semaphore: Arc<Semaphore>,
}

impl LimitedSpawner {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Spawn `f` without waiting for a slot. The task resolves to `None` when
    /// `cancel` fires before a slot frees up; `f` is then never polled.
    pub fn spawn<F>(
        &self,
        cancel: CancellationToken,
        f: F,
    ) -> tokio::task::JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                permit = semaphore.acquire_owned() => permit.ok()?,
            };
            let _permit = permit;
            Some(f.await)
        })
    }
}
