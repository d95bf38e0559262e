// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded pools running CPU-bound filter work off the async runtime.

use pingora_error::{Error, ErrorType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Error type used when a pool refuses work
pub(crate) const TOO_BUSY: ErrorType = ErrorType::Custom("TooBusy");

#[derive(Debug)]
struct QueueSlot(Arc<AtomicUsize>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A pool running at most a fixed number of tasks at once. If a queue limit is configured,
/// work beyond it is rejected rather than queued.
#[derive(Debug, Clone)]
pub(crate) struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    max_queue_depth: Option<usize>,
}

impl WorkerPool {
    pub(crate) fn new(name: &'static str, threads: usize, max_queue_depth: Option<usize>) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(threads.max(1))),
            queued: Default::default(),
            max_queue_depth,
        }
    }

    pub(crate) fn close(&self) {
        self.permits.close();
    }

    /// Runs `work` on a blocking thread once a permit is available.
    pub(crate) async fn run<T, F>(&self, work: F) -> Result<T, Box<Error>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let max = self.max_queue_depth.unwrap_or(usize::MAX);
        if self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < max).then_some(queued + 1)
            })
            .is_err()
        {
            return Err(Error::explain(
                TOO_BUSY,
                format!("{} queue is full", self.name),
            ));
        }
        let slot = QueueSlot(self.queued.clone());

        let permit = self.permits.clone().acquire_owned().await.map_err(|err| {
            Error::because(ErrorType::InternalError, "worker pool shut down", err)
        })?;
        drop(slot);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(|err| Error::because(ErrorType::InternalError, "worker task failed", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use test_log::test;

    #[test(tokio::test)]
    async fn runs_work() {
        let pool = WorkerPool::new("test", 2, None);
        assert_eq!(pool.run(|| 40 + 2).await.unwrap(), 42);
    }

    #[test(tokio::test)]
    async fn rejects_beyond_queue_depth() {
        let pool = WorkerPool::new("test", 1, Some(1));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let busy_pool = pool.clone();
        let busy = tokio::spawn(async move {
            busy_pool
                .run(move || {
                    let _ = started_tx.send(());
                    let _ = release_rx.recv();
                })
                .await
        });
        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // One task may wait for the busy thread, the next one is rejected
        let waiting_pool = pool.clone();
        let waiting = tokio::spawn(async move { waiting_pool.run(|| 1).await });
        while pool.queued.load(Ordering::Acquire) == 0 {
            tokio::task::yield_now().await;
        }
        let err = pool.run(|| 2).await.unwrap_err();
        assert_eq!(err.etype(), &TOO_BUSY);

        release_tx.send(()).unwrap();
        busy.await.unwrap().unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), 1);
    }

    #[test(tokio::test)]
    async fn closed_pool_fails() {
        let pool = WorkerPool::new("test", 1, None);
        pool.close();
        assert!(pool.run(|| 1).await.is_err());
    }
}
