//! # Ordered Execution Queue
//!
//! Serializes every task of one session into a single timeline.
//!
//! A dedicated worker owns the session state and drains a channel of boxed
//! tasks. Tasks run strictly in the order [`OrderedQueue::submit`] was called,
//! one at a time, even when a task suspends: nothing queued behind it starts
//! until it finishes. Callers get their own task's outcome through a [`Ticket`].
//!
//! ## Invariants
//!
//! - Submission order is execution order; the channel is FIFO and the send
//!   happens synchronously inside `submit`.
//! - A failing task (panic or deadline) is reported to its own caller only;
//!   the worker moves on to the next task.
//! - An idle queue holds no task state, only the channel.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The worker is gone; the session was destroyed.
    Closed,
    /// The task panicked.
    Panicked,
    /// The task exceeded its deadline and was dropped.
    TimedOut(Duration),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "queue closed"),
            Self::Panicked => write!(f, "task panicked"),
            Self::TimedOut(d) => write!(f, "task exceeded its {:?} deadline", d),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

type Task<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

fn task<S, F>(f: F) -> Task<S>
where
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// The eventual outcome of one submitted task.
pub struct Ticket<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> Ticket<R> {
    pub async fn wait(self) -> Result<R> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Closed),
        }
    }
}

/// Single-worker FIFO executor owning a state `S`.
pub struct OrderedQueue<S> {
    tx: mpsc::UnboundedSender<Task<S>>,
    depth: Arc<AtomicUsize>,
    timeout: Option<Duration>,
}

impl<S: Send + 'static> OrderedQueue<S> {
    /// Moves `state` into a freshly spawned worker.
    pub fn spawn(state: S, timeout: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        tokio::spawn(Self::drain(state, rx, depth.clone()));

        Self { tx, depth, timeout }
    }

    async fn drain(mut state: S, mut rx: mpsc::UnboundedReceiver<Task<S>>, depth: Arc<AtomicUsize>) {
        while let Some(task) = rx.recv().await {
            task(&mut state).await;
            depth.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Appends `f` to the timeline. The position is fixed when this returns,
    /// whether or not the ticket is ever awaited.
    pub fn submit<F, R>(&self, f: F) -> Ticket<R>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, R> + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, rx) = oneshot::channel();
        let timeout = self.timeout;

        let job = task(move |state: &mut S| {
            async move {
                let body = AssertUnwindSafe(f(state)).catch_unwind();
                let outcome = match timeout {
                    Some(deadline) => match tokio::time::timeout(deadline, body).await {
                        Ok(run) => run.map_err(|_| Error::Panicked),
                        Err(_) => Err(Error::TimedOut(deadline)),
                    },
                    None => body.await.map_err(|_| Error::Panicked),
                };
                if let Err(e) = &outcome {
                    tracing::warn!(error = %e, "queued task failed");
                }
                let _ = result_tx.send(outcome);
            }
            .boxed()
        });

        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(job).is_err() {
            // The job (and its sender) was dropped with the error; the ticket reports Closed.
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }

        Ticket { rx }
    }

    /// Tasks submitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rand::Rng;

    use super::*;

    fn sleep_ms(ms: u64) -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_tasks_run_in_submission_order_despite_suspension() {
        let queue = OrderedQueue::spawn(Vec::<usize>::new(), None);
        let mut rng = rand::thread_rng();

        let tickets: Vec<_> = (0..20)
            .map(|i| {
                let delay = rng.gen_range(0..5);
                queue.submit(move |log: &mut Vec<usize>| {
                    async move {
                        sleep_ms(delay).await;
                        log.push(i);
                    }
                    .boxed()
                })
            })
            .collect();

        for ticket in tickets.into_iter().rev() {
            ticket.wait().await.unwrap();
        }

        let log = queue.submit(|log: &mut Vec<usize>| async move { log.clone() }.boxed()).wait().await.unwrap();
        assert_eq!(log, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_submitters_never_interleave() {
        let queue = Arc::new(OrderedQueue::spawn(Vec::<(usize, &'static str)>::new(), None));

        let mut handles = Vec::new();
        for i in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.submit(move |log: &mut Vec<(usize, &'static str)>| {
                    async move {
                        log.push((i, "start"));
                        sleep_ms(1).await;
                        log.push((i, "end"));
                    }
                    .boxed()
                })
                .wait()
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let log = queue.submit(|log: &mut Vec<(usize, &'static str)>| async move { log.clone() }.boxed()).wait().await.unwrap();
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0, "task bodies interleaved: {:?}", log);
            assert_eq!(pair[0].1, "start");
            assert_eq!(pair[1].1, "end");
        }
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stop_the_queue() {
        let queue = OrderedQueue::spawn(0u32, None);

        let bad: Ticket<()> = queue.submit(|_: &mut u32| async move { panic!("boom") }.boxed());
        let good = queue.submit(|n: &mut u32| async move { *n += 1; *n }.boxed());

        assert_eq!(bad.wait().await, Err(Error::Panicked));
        assert_eq!(good.wait().await, Ok(1));
    }

    #[tokio::test]
    async fn test_deadline_drops_the_task_and_continues() {
        let queue = OrderedQueue::spawn(Vec::<&'static str>::new(), Some(Duration::from_millis(20)));

        let slow = queue.submit(|log: &mut Vec<&'static str>| {
            async move {
                sleep_ms(500).await;
                log.push("slow");
            }
            .boxed()
        });
        let fast = queue.submit(|log: &mut Vec<&'static str>| {
            async move {
                log.push("fast");
                log.clone()
            }
            .boxed()
        });

        assert!(matches!(slow.wait().await, Err(Error::TimedOut(_))));
        assert_eq!(fast.wait().await.unwrap(), vec!["fast"]);
    }

    #[tokio::test]
    async fn test_later_task_waits_for_suspended_one() {
        let queue = OrderedQueue::spawn((), None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let seen = seen.clone();
            queue.submit(move |_: &mut ()| {
                async move {
                    let _ = release_rx.await;
                    seen.lock().unwrap().push("first");
                }
                .boxed()
            })
        };
        let second = {
            let seen = seen.clone();
            queue.submit(move |_: &mut ()| {
                async move {
                    seen.lock().unwrap().push("second");
                }
                .boxed()
            })
        };

        sleep_ms(20).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(queue.pending(), 2);

        release_tx.send(()).unwrap();
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(queue.pending(), 0);
    }
}
