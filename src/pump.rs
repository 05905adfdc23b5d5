// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The periodic update pump.
//!
//! A small helper task that invokes an action at a bounded rate. The
//! session uses one pump per connection with the action set to the
//! framebuffer flush, so outgoing updates never exceed the configured
//! frame rate no matter how fast the client requests them.
//!
//! [`PumpHandle::signal`] short-circuits the wait before the next
//! invocation, which keeps latency low when a client request arrives
//! mid-interval. [`UpdatePump::stop`] terminates the task promptly and is
//! idempotent.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// A cloneable signal for waking the pump early.
#[derive(Clone)]
pub struct PumpHandle {
    signal: Arc<Notify>,
}

impl PumpHandle {
    /// Wakes the pump without waiting for the next tick.
    pub fn signal(&self) {
        self.signal.notify_one();
    }
}

/// A repeating task bounded to at most `rate_hz` invocations per second.
pub struct UpdatePump {
    signal: Arc<Notify>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl UpdatePump {
    /// Spawns the pump task.
    ///
    /// `action` runs on every tick; `rate_hz` bounds the steady-state tick
    /// frequency (values of zero are treated as one). When
    /// `run_immediately` is set the first invocation happens right away
    /// instead of after the first interval.
    pub fn start<F, Fut>(mut action: F, rate_hz: u32, run_immediately: bool) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signal = Arc::new(Notify::new());
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let period = Duration::from_secs(1) / rate_hz.max(1);

        let wake = signal.clone();
        let task = tokio::spawn(async move {
            let mut last_run = if run_immediately {
                action().await;
                Instant::now()
            } else {
                Instant::now()
            };

            loop {
                let since = last_run.elapsed();
                if since < period {
                    tokio::select! {
                        () = tokio::time::sleep(period - since) => {}
                        () = wake.notified() => {}
                        _ = stop_rx.changed() => return,
                    }
                }
                if *stop_rx.borrow() {
                    return;
                }
                action().await;
                last_run = Instant::now();
            }
        });

        Self {
            signal,
            stop_tx,
            task: Some(task),
        }
    }

    /// Returns a handle for waking the pump from other tasks.
    #[must_use]
    pub fn handle(&self) -> PumpHandle {
        PumpHandle {
            signal: self.signal.clone(),
        }
    }

    /// Stops the pump and waits for the task to exit. Safe to call more
    /// than once.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        self.signal.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for UpdatePump {
    fn drop(&mut self) {
        // Without an await point the best a Drop can do is flag the task;
        // it observes the stop on its next wakeup.
        let _ = self.stop_tx.send(true);
        self.signal.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn respects_the_configured_rate() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut pump = UpdatePump::start(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
            20,
            false,
        );

        tokio::time::sleep(Duration::from_millis(280)).await;
        pump.stop().await;

        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 3, "expected a few ticks, got {ticks}");
        assert!(ticks <= 8, "rate bound exceeded: {ticks} ticks");
    }

    #[tokio::test]
    async fn signal_short_circuits_the_wait() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut pump = UpdatePump::start(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
            1, // one-second period: only a signal can tick this fast
            false,
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        pump.handle().signal();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        pump.stop().await;
    }

    #[tokio::test]
    async fn stop_is_prompt_and_idempotent() {
        let mut pump = UpdatePump::start(|| async {}, 1, false);
        let started = Instant::now();
        pump.stop().await;
        pump.stop().await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn run_immediately_fires_before_first_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut pump = UpdatePump::start(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
            1,
            true,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        pump.stop().await;
    }
}
