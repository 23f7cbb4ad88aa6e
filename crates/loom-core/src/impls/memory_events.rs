//! In-memory event broker built on `tokio::sync::broadcast`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::{Result, TaskQueueError};
use crate::ports::{EventBroker, SchedulerEvent};

const CHANNEL_CAPACITY: usize = 256;

pub struct MemoryEventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl MemoryEventBus {
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self { sender })
    }

    pub fn connect(self: &Arc<Self>) -> MemoryEventBroker {
        MemoryEventBroker {
            bus: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }
}

pub struct MemoryEventBroker {
    bus: Arc<MemoryEventBus>,
    closed: AtomicBool,
}

#[async_trait]
impl EventBroker for MemoryEventBroker {
    async fn publish(&self, event: SchedulerEvent) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskQueueError::Backend("event broker connection closed".into()));
        }
        tracing::trace!(?event, "publish");
        // 購読者がいない時の SendError は無視
        let _ = self.bus.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<SchedulerEvent>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskQueueError::Backend("event broker connection closed".into()));
        }
        Ok(self.bus.sender.subscribe())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_on_other_connections_receive_events() {
        let bus = MemoryEventBus::new();
        let publisher = bus.connect();
        let subscriber = bus.connect();
        let mut events = subscriber.subscribe().unwrap();

        publisher
            .publish(SchedulerEvent::TaskAdded { task: "report".into() })
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SchedulerEvent::TaskAdded { task: "report".into() }
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let broker = MemoryEventBus::new().connect();
        assert!(broker.publish(SchedulerEvent::TaskAdded { task: "x".into() }).await.is_ok());
    }

    #[tokio::test]
    async fn closed_connection_rejects_publish() {
        let broker = MemoryEventBus::new().connect();
        broker.close().await;
        assert!(broker.subscribe().is_err());
        assert!(broker.publish(SchedulerEvent::TaskAdded { task: "x".into() }).await.is_err());
    }
}
