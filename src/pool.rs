use crate::error::PulseError;
use crate::telemetry::{db_metrics, CoreEvent, CoreEventListener};
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool with a bounded submission queue.
///
/// The pool never grows and `submit` never blocks; a full queue is reported to the caller
/// as [`PulseError::Backpressure`].
#[derive(Debug)]
pub struct WritePool {
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queued: Arc<AtomicUsize>,
    capacity: usize,
    warn_interval: Duration,
    last_warn: Mutex<Option<Instant>>,
    events: Arc<dyn CoreEventListener>,
}

impl WritePool {
    /// Spawns `workers` threads sharing one queue of `capacity` slots.
    pub fn new(
        workers: usize,
        capacity: usize,
        warn_interval: Duration,
        events: Arc<dyn CoreEventListener>,
    ) -> Result<Self, PulseError> {
        if workers == 0 || capacity == 0 {
            return Err(PulseError::InvalidArgument(
                "write pool needs at least one worker and one queue slot".to_string(),
            ));
        }
        let (sender, receiver) = mpsc::sync_channel::<Job>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let queued = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver = Arc::clone(&receiver);
            let queued = Arc::clone(&queued);
            let handle = thread::Builder::new()
                .name(format!("pulse-write-{}", i))
                .spawn(move || worker_loop(receiver, queued))?;
            handles.push(handle);
        }

        Ok(WritePool {
            sender: Some(sender),
            workers: handles,
            queued,
            capacity,
            warn_interval,
            last_warn: Mutex::new(None),
            events,
        })
    }

    /// Queues `task` and returns a future resolving to its result.
    ///
    /// A saturated queue yields an already-failed future; the task is not run.
    pub fn submit<T, F>(&self, task: F) -> BoxFuture<'static, Result<T, PulseError>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, PulseError> + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return future::ready(Err(PulseError::BackgroundTaskError(
                "write pool is shut down".to_string(),
            )))
            .boxed();
        };

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(task());
        });

        let queued = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
        match sender.try_send(job) {
            Ok(()) => {
                db_metrics::record_write_queue_depth(queued);
                if queued > self.capacity / 2 {
                    self.warn_pressure(queued);
                }
                async move {
                    rx.await.map_err(|_| {
                        PulseError::BackgroundTaskError("write task dropped before completing".to_string())
                    })?
                }
                .boxed()
            }
            Err(TrySendError::Full(_)) => {
                let queued = self.queued.fetch_sub(1, Ordering::AcqRel) - 1;
                tracing::error!(queued, capacity = self.capacity, "write queue full, rejecting task");
                db_metrics::record_write_rejected();
                self.events.on_event(CoreEvent::WriteRejected {
                    queued,
                    capacity: self.capacity,
                });
                future::ready(Err(PulseError::Backpressure {
                    queued,
                    capacity: self.capacity,
                }))
                .boxed()
            }
            Err(TrySendError::Disconnected(_)) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                future::ready(Err(PulseError::BackgroundTaskError(
                    "write workers are gone".to_string(),
                )))
                .boxed()
            }
        }
    }

    /// Tasks submitted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn warn_pressure(&self, queued: usize) {
        let Ok(mut last) = self.last_warn.lock() else {
            return;
        };
        let now = Instant::now();
        if last.map_or(true, |t| now.duration_since(t) >= self.warn_interval) {
            *last = Some(now);
            tracing::warn!(queued, capacity = self.capacity, "write queue above half capacity");
            self.events.on_event(CoreEvent::WriteQueuePressure {
                queued,
                capacity: self.capacity,
            });
        }
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>, queued: Arc<AtomicUsize>) {
    loop {
        let job = {
            let Ok(guard) = receiver.lock() else {
                break;
            };
            match guard.recv() {
                Ok(job) => job,
                Err(_) => break,
            }
        };
        queued.fetch_sub(1, Ordering::AcqRel);
        // A panicking task drops its result sender; the caller sees the failure, the
        // worker keeps serving.
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("write task panicked");
        }
    }
}

/// Implement Drop to let queued tasks finish and join the workers.
impl Drop for WritePool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
