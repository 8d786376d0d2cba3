// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use crate::Error;
use futures::executor::ThreadPool;
use futures_timer::Delay;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared executor used by the exchange layer.
///
/// One scheduler provides both halves of the layer's timing needs: immediate
/// execution of write and callback work on a thread pool, and delayed
/// execution of retransmission work. Cloning a `Scheduler` yields another
/// handle to the same pool, so a single instance can be shared between a
/// client and the code driving its socket.
#[derive(Clone)]
pub struct Scheduler {
    pool: ThreadPool,
}

impl Scheduler {
    /// Creates a new scheduler with its own thread pool.
    pub fn new() -> Result<Scheduler, Error> {
        let pool = ThreadPool::new()?;
        Ok(Scheduler { pool })
    }

    /// Spawns a future onto the pool.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pool.spawn_ok(future);
    }

    /// Runs `task` after `delay` has elapsed, unless the returned handle is
    /// cancelled first.
    ///
    /// Cancellation is best-effort: a handle cancelled while the task is
    /// already running has no effect. Anything scheduled here must therefore
    /// re-check its own preconditions when it fires.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = ScheduledTask {
            cancelled: cancelled.clone(),
        };

        self.pool.spawn_ok(async move {
            Delay::new(delay).await;
            if !cancelled.load(Ordering::Acquire) {
                task();
            }
        });

        handle
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Scheduler").finish()
    }
}

/// Handle to a task registered with [`Scheduler::schedule`].
#[derive(Debug)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Requests that the task not run when its delay expires.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;

    #[test]
    fn scheduled_task_fires() {
        let scheduler = Scheduler::new().expect("scheduler");
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        let _handle = scheduler.schedule(Duration::from_millis(10), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_task_does_not_fire() {
        let scheduler = Scheduler::new().expect("scheduler");
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        let handle = scheduler.schedule(Duration::from_millis(100), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();

        sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
