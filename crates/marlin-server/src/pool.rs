// Worker pool executing application callbacks.
//
// A fixed set of worker tasks drains one shared job queue.  A panicking
// callback is caught and logged; the worker keeps going and the channel
// that produced the event stays alive.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use marlin_protocol::Event;

use crate::EventCallback;

pub(crate) struct CallbackJob {
    pub callback: EventCallback,
    pub app_data: u64,
    pub event: Event,
}

impl std::fmt::Debug for CallbackJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackJob")
            .field("app_data", &self.app_data)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

pub(crate) struct CallbackPool {
    tx: mpsc::Sender<CallbackJob>,
}

impl CallbackPool {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<CallbackJob>(workers * 32);
        let rx = Arc::new(Mutex::new(rx));
        for index in 0..workers {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                debug!(index, "callback worker started");
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => run_job(job),
                        None => break,
                    }
                }
                debug!(index, "callback worker stopped");
            });
        }
        CallbackPool { tx }
    }

    /// Submit a job, waiting when the pool is saturated.  Returns the job
    /// back when the pool is gone so the caller can run it inline.
    pub async fn submit(&self, job: CallbackJob) -> Result<(), CallbackJob> {
        self.tx.send(job).await.map_err(|rejected| rejected.0)
    }
}

/// Run one callback, containing a panic to this event.
pub(crate) fn run_job(job: CallbackJob) {
    let number = job.event.number;
    let result = catch_unwind(AssertUnwindSafe(|| {
        (job.callback)(job.app_data, job.event);
    }));
    if result.is_err() {
        error!(number, "application callback panicked; event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn panicking_callback_does_not_kill_the_worker() {
        let pool = CallbackPool::new(1);
        let delivered = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&delivered);
        let callback: EventCallback = Arc::new(move |_, event| {
            if event.payload.as_text() == "boom" {
                panic!("boom");
            }
            seen.fetch_add(1, Ordering::SeqCst);
        });

        for text in ["boom", "fine"] {
            pool.submit(CallbackJob {
                callback: Arc::clone(&callback),
                app_data: 0,
                event: Event::message(text),
            })
            .await
            .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
