use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatch::{process, Counters, DispatchStats, Dispatcher, MessageHandler};
use crate::holder::HolderStream;

/// One task per message, at most `permits` in flight.
pub struct SemaphoreDispatcher {
    permits: usize,
    counters: Arc<Counters>,
    stop: CancellationToken,
}

impl SemaphoreDispatcher {
    /// Create a dispatcher allowing `permits` concurrent messages.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits: permits.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize)),
            counters: Arc::new(Counters::default()),
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Dispatcher for SemaphoreDispatcher {
    async fn run(&self, mut stream: HolderStream, handler: Arc<dyn MessageHandler>) {
        info!(permits = self.permits, "Semaphore dispatcher started");
        let semaphore = Arc::new(Semaphore::new(self.permits));

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
                permit = Arc::clone(&semaphore).acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                message.release("dispatcher closed");
                break;
            };
            let handler = Arc::clone(&handler);
            let counters = Arc::clone(&self.counters);
            tokio::spawn(async move {
                process(handler.as_ref(), message, &counters).await;
                drop(permit);
            });
        }

        // Wait for in-flight messages.
        let _ = semaphore.acquire_many(self.permits as u32).await;
        debug!(stats = ?self.counters.snapshot(), "Semaphore dispatcher stopped");
    }

    fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    fn shutdown(&self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{close_when_drained, Recording};
    use crate::holder::InboundHolder;
    use crate::message::{LeaseTracker, Message, Payload};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use switchyard_protocol::Headers;

    #[tokio::test]
    async fn test_dispatches_all_and_waits() {
        let holder = InboundHolder::with_capacity(64);
        let stream = holder.subscribe().unwrap();
        for i in 0..20u8 {
            assert!(holder.publish(Message::new(Headers::new(), vec![i + 1])));
        }

        let handler = Arc::new(Recording {
            delay: Some(Duration::from_millis(5)),
            ..Recording::default()
        });
        let dispatcher = SemaphoreDispatcher::new(4);

        close_when_drained(Arc::clone(&holder));
        dispatcher
            .run(stream, Arc::clone(&handler) as Arc<dyn MessageHandler>)
            .await;

        assert_eq!(handler.seen.lock().await.len(), 20);
        assert!(handler.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(dispatcher.stats().dispatched, 20);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_isolated() {
        let tracker = LeaseTracker::new();
        let holder = InboundHolder::with_capacity(16);
        let stream = holder.subscribe().unwrap();
        for payload in [&b"a"[..], b"", b"panic", b"b"] {
            holder.publish(Message::new(
                Headers::new(),
                Payload::tracked(payload.to_vec(), &tracker),
            ));
        }

        let handler = Arc::new(Recording::default());
        let dispatcher = SemaphoreDispatcher::new(2);
        close_when_drained(Arc::clone(&holder));
        dispatcher
            .run(stream, Arc::clone(&handler) as Arc<dyn MessageHandler>)
            .await;

        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                dispatched: 2,
                dropped: 1,
                panicked: 1
            }
        );
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_only_for_in_flight() {
        let tracker = LeaseTracker::new();
        let holder = InboundHolder::with_capacity(64);
        let stream = holder.subscribe().unwrap();
        for i in 0..10u8 {
            holder.publish(Message::new(
                Headers::new(),
                Payload::tracked(vec![i + 1], &tracker),
            ));
        }

        let handler = Arc::new(Recording {
            delay: Some(Duration::from_secs(1)),
            ..Recording::default()
        });
        let dispatcher = Arc::new(SemaphoreDispatcher::new(3));
        let run = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            let handler = Arc::clone(&handler) as Arc<dyn MessageHandler>;
            async move { dispatcher.run(stream, handler).await }
        });
        while handler.peak.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }

        dispatcher.shutdown();
        run.await.unwrap();

        assert_eq!(handler.seen.lock().await.len(), 3);
        drop(holder);
        assert_eq!(tracker.outstanding(), 0);
    }
}
