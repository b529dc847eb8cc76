//! Bounded fan-out of the event stream to sink workers.
//!
//! One queue per subscribed sink. The default policy blocks the producer
//! when any queue is full, which backpressures the normalizer, the receive
//! loop, and (via withheld standby status) the server's WAL retention. The
//! opt-in drop-oldest policy instead sheds the oldest queued events and
//! counts them.

use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use pgfan_core::CdcEvent;

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Block the producer until the subscriber catches up.
    #[default]
    Block,
    /// Drop the oldest queued events and count them.
    DropOldest,
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

enum QueueTx {
    Bounded(mpsc::Sender<CdcEvent>),
    // A single-receiver broadcast channel is a ring buffer: on overflow the
    // receiver observes Lagged(n) with the number of dropped events.
    Ring(broadcast::Sender<CdcEvent>),
}

/// Producer side of the bus.
pub struct EventBus {
    queues: Vec<(String, QueueTx)>,
}

/// Consumer side of one subscription.
pub enum Subscription {
    Bounded(mpsc::Receiver<CdcEvent>),
    Ring(broadcast::Receiver<CdcEvent>),
}

impl Subscription {
    /// Receive the next event. Returns the event plus the number of events
    /// dropped before it (always 0 under the blocking policy). `None` means
    /// the bus shut down and the queue is drained.
    pub async fn recv(&mut self) -> Option<(CdcEvent, u64)> {
        match self {
            Subscription::Bounded(rx) => rx.recv().await.map(|e| (e, 0)),
            Subscription::Ring(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, 0)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The next successful recv reports the loss.
                        match rx.recv().await {
                            Ok(event) => return Some((event, n)),
                            Err(broadcast::error::RecvError::Lagged(more)) => {
                                warn!(dropped = n + more, "Subscriber lagging badly");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self { queues: Vec::new() }
    }

    /// Add a subscriber with its own bounded queue.
    pub fn subscribe(
        &mut self,
        name: &str,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Subscription {
        match policy {
            OverflowPolicy::Block => {
                let (tx, rx) = mpsc::channel(capacity);
                self.queues.push((name.to_string(), QueueTx::Bounded(tx)));
                Subscription::Bounded(rx)
            }
            OverflowPolicy::DropOldest => {
                let (tx, rx) = broadcast::channel(capacity);
                self.queues.push((name.to_string(), QueueTx::Ring(tx)));
                Subscription::Ring(rx)
            }
        }
    }

    /// Enqueue one event to every subscriber. Blocks while any blocking
    /// queue is full; returns the number of live subscribers.
    pub async fn publish(&self, event: &CdcEvent) -> usize {
        let mut delivered = 0;
        for (name, queue) in &self.queues {
            match queue {
                QueueTx::Bounded(tx) => {
                    if tx.send(event.clone()).await.is_ok() {
                        delivered += 1;
                    } else {
                        warn!(sink = %name, "Subscriber queue closed");
                    }
                }
                QueueTx::Ring(tx) => {
                    // Errors only when the receiver is gone.
                    if tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.queues.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgfan_core::{Op, Source};

    fn make_event(lsn: u64) -> CdcEvent {
        CdcEvent {
            op: Op::Create,
            source: Source {
                schema: "public".into(),
                table: "users".into(),
                lsn,
                xid: None,
                commit_time: None,
                in_stream: false,
            },
            before: None,
            after: None,
            ts_ns: 0,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let mut bus = EventBus::new();
        let mut a = bus.subscribe("a", 10, OverflowPolicy::Block);
        let mut b = bus.subscribe("b", 10, OverflowPolicy::Block);

        bus.publish(&make_event(1)).await;
        bus.publish(&make_event(2)).await;
        drop(bus);

        for sub in [&mut a, &mut b] {
            let (first, _) = sub.recv().await.unwrap();
            let (second, _) = sub.recv().await.unwrap();
            assert_eq!(first.source.lsn, 1);
            assert_eq!(second.source.lsn, 2);
            assert!(sub.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_per_subscriber_ordering_is_lsn_order() {
        let mut bus = EventBus::new();
        let mut sub = bus.subscribe("a", 100, OverflowPolicy::Block);

        for lsn in 1..=50 {
            bus.publish(&make_event(lsn)).await;
        }
        drop(bus);

        let mut last = 0;
        while let Some((event, _)) = sub.recv().await {
            assert!(event.source.lsn > last);
            last = event.source.lsn;
        }
        assert_eq!(last, 50);
    }

    #[tokio::test]
    async fn test_blocking_policy_backpressures_producer() {
        let mut bus = EventBus::new();
        let mut sub = bus.subscribe("slow", 1, OverflowPolicy::Block);

        bus.publish(&make_event(1)).await;

        // The queue is full; the next publish must not complete until the
        // consumer drains one event.
        let second = make_event(2);
        let publish = bus.publish(&second);
        tokio::pin!(publish);
        assert!(futures_ready_now(publish.as_mut()).is_none());

        let (event, _) = sub.recv().await.unwrap();
        assert_eq!(event.source.lsn, 1);
        publish.await;

        let (event, _) = sub.recv().await.unwrap();
        assert_eq!(event.source.lsn, 2);
    }

    #[tokio::test]
    async fn test_drop_oldest_reports_dropped_count() {
        let mut bus = EventBus::new();
        let mut sub = bus.subscribe("lossy", 2, OverflowPolicy::DropOldest);

        for lsn in 1..=5 {
            bus.publish(&make_event(lsn)).await;
        }

        // Capacity 2: events 1..=3 were shed; 4 arrives with dropped=3.
        let (event, dropped) = sub.recv().await.unwrap();
        assert_eq!(event.source.lsn, 4);
        assert_eq!(dropped, 3);

        let (event, dropped) = sub.recv().await.unwrap();
        assert_eq!(event.source.lsn, 5);
        assert_eq!(dropped, 0);
    }

    /// Poll a future once without waiting.
    fn futures_ready_now<F: std::future::Future>(
        fut: std::pin::Pin<&mut F>,
    ) -> Option<F::Output> {
        use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

        fn noop_raw_waker() -> RawWaker {
            fn clone(_: *const ()) -> RawWaker {
                noop_raw_waker()
            }
            fn noop(_: *const ()) {}
            RawWaker::new(
                std::ptr::null(),
                &RawWakerVTable::new(clone, noop, noop, noop),
            )
        }

        let waker = unsafe { Waker::from_raw(noop_raw_waker()) };
        let mut cx = Context::from_waker(&waker);
        match fut.poll(&mut cx) {
            Poll::Ready(out) => Some(out),
            Poll::Pending => None,
        }
    }
}
