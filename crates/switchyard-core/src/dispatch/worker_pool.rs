use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::dispatch::{process, Counters, DispatchStats, Dispatcher, MessageHandler};
use crate::holder::HolderStream;
use crate::message::Message;

/// A fixed pool of workers pulling from an internal queue.
///
/// The queue holds at most one message per worker, so the holder keeps
/// the backlog. [`Dispatcher::shutdown`] stops workers between messages and
/// releases whatever is still queued.
pub struct WorkerPoolDispatcher {
    workers: usize,
    counters: Arc<Counters>,
    stop: CancellationToken,
}

impl WorkerPoolDispatcher {
    /// Create a dispatcher with `workers` workers.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            counters: Arc::new(Counters::default()),
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Dispatcher for WorkerPoolDispatcher {
    async fn run(&self, mut stream: HolderStream, handler: Arc<dyn MessageHandler>) {
        info!(workers = self.workers, "Worker pool dispatcher started");
        let (tx, rx) = mpsc::channel::<Message>(self.workers);
        let rx = Arc::new(Mutex::new(rx));

        let workers: Vec<_> = (0..self.workers)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                let counters = Arc::clone(&self.counters);
                let stop = self.stop.clone();
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            biased;
                            () = stop.cancelled() => None,
                            next = async { rx.lock().await.recv().await } => next,
                        };
                        let Some(message) = next else { break };
                        process(handler.as_ref(), message, &counters).await;
                    }
                    trace!(worker, "Worker exiting");
                })
            })
            .collect();

        loop {
            let message = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                next = stream.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            let permit = tokio::select! {
                biased;
                () = self.stop.cancelled() => {
                    message.release("dispatcher stopped");
                    break;
                }
                permit = tx.reserve() => permit,
            };
            match permit {
                Ok(permit) => permit.send(message),
                Err(_) => {
                    message.release("worker pool closed");
                    break;
                }
            }
        }

        // Without a stop, workers drain the queue and then see it closed.
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
        let mut rx = rx.lock().await;
        while let Ok(message) = rx.try_recv() {
            message.release("dispatcher stopped");
        }
        debug!(stats = ?self.counters.snapshot(), "Worker pool dispatcher stopped");
    }

    fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    fn shutdown(&self) {
        self.stop.cancel();
    }
}
