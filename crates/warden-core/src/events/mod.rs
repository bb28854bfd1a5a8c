//! Event broker: fan-out of operation lifecycle events to any number of
//! live subscribers.
//!
//! Built on `tokio::sync::broadcast`. Each subscriber owns a bounded buffer
//! with drop-oldest semantics; `publish` only enqueues and therefore
//! completes in bounded time, which keeps the journal commit path fast. A
//! subscriber that falls behind has old events dropped and sees a
//! [`Event::Lost`] marker on its next receive, at which point it can re-sync
//! by scanning the journal from the last id it saw.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use warden_db::models::Operation;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Phase markers published around task milestones so an external hook
/// runner can fire user scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    SnapshotStart,
    SnapshotEnd,
    SnapshotError,
    ForgetStart,
    ForgetEnd,
    PruneStart,
    PruneEnd,
}

/// A typed notification delivered to hook subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookNotification {
    pub phase: HookPhase,
    pub repo_id: String,
    pub plan_id: String,
    pub op_id: Option<i64>,
    pub flow_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// An event on the broker. Every operation event corresponds to exactly one
/// committed journal mutation and is delivered in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OperationCreated(Operation),
    OperationUpdated(Operation),
    OperationDeleted { id: i64 },
    Hook(HookNotification),
    /// Synthesized receiver-side when the subscriber's buffer overflowed.
    /// `missed` events were dropped; re-sync via a journal scan.
    Lost { missed: u64 },
}

/// Cheap-to-clone handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct Broker {
    tx: broadcast::Sender<Event>,
}

impl Broker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Enqueue an event for every live subscriber. Never blocks; an empty
    /// subscriber list is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Register a new subscriber. Events published before this call are not
    /// delivered; late joiners catch up through the journal.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.tx.subscribe()),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A subscriber's view of the broker. Lag is surfaced in-band as
/// [`Event::Lost`] rather than as a stream error.
pub struct EventStream {
    inner: BroadcastStream<Event>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(event)),
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                Poll::Ready(Some(Event::Lost { missed }))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use warden_db::models::{OpPayload, OpStatus, Operation};

    fn test_op(id: i64) -> Operation {
        Operation {
            id,
            flow_id: None,
            repo_id: "r1".into(),
            plan_id: "p1".into(),
            snapshot_id: None,
            status: OpStatus::Pending,
            started_at_ms: 1_000,
            ended_at_ms: None,
            payload: OpPayload::backup(),
            log_ref: None,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let broker = Broker::new(8);
        let mut stream = broker.subscribe();

        for id in 1..=3 {
            broker.publish(Event::OperationCreated(test_op(id)));
        }

        for expected in 1..=3 {
            match stream.next().await {
                Some(Event::OperationCreated(op)) => assert_eq!(op.id, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lost_marker() {
        let broker = Broker::new(2);
        let mut stream = broker.subscribe();

        // Overflow the two-slot buffer: the oldest events are dropped.
        for id in 1..=5 {
            broker.publish(Event::OperationCreated(test_op(id)));
        }

        match stream.next().await {
            Some(Event::Lost { missed }) => assert_eq!(missed, 3),
            other => panic!("expected Lost marker, got {other:?}"),
        }

        // The retained tail is still delivered, in order.
        match stream.next().await {
            Some(Event::OperationCreated(op)) => assert_eq!(op.id, 4),
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.next().await {
            Some(Event::OperationCreated(op)) => assert_eq!(op.id, 5),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let json = serde_json::to_string(&Event::OperationDeleted { id: 9 }).unwrap();
        assert!(json.contains(r#""type":"operation_deleted""#), "got: {json}");

        let json = serde_json::to_string(&Event::Lost { missed: 3 }).unwrap();
        assert!(json.contains(r#""type":"lost""#), "got: {json}");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let broker = Broker::new(4);
        assert_eq!(broker.subscriber_count(), 0);
        broker.publish(Event::OperationDeleted { id: 9 });
    }

    #[tokio::test]
    async fn each_subscriber_gets_every_event() {
        let broker = Broker::new(8);
        let mut a = broker.subscribe();
        let mut b = broker.subscribe();

        broker.publish(Event::Hook(HookNotification {
            phase: HookPhase::SnapshotStart,
            repo_id: "r1".into(),
            plan_id: "p1".into(),
            op_id: Some(1),
            flow_id: Some(1),
            message: None,
        }));

        for stream in [&mut a, &mut b] {
            match stream.next().await {
                Some(Event::Hook(n)) => assert_eq!(n.phase, HookPhase::SnapshotStart),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
