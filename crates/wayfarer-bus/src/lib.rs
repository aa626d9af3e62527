use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, RwLock};
use wayfarer_schema::BusMessage;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Topic {
    TurnAccepted,
    ReplyReady,
    TurnFailed,
    SecurityBlocked,
    PersistenceDegraded,
    VoiceStateChanged,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::TurnAccepted,
        Topic::ReplyReady,
        Topic::TurnFailed,
        Topic::SecurityBlocked,
        Topic::PersistenceDegraded,
        Topic::VoiceStateChanged,
    ];

    pub fn from_message(msg: &BusMessage) -> Self {
        match msg {
            BusMessage::TurnAccepted { .. } => Topic::TurnAccepted,
            BusMessage::ReplyReady { .. } => Topic::ReplyReady,
            BusMessage::TurnFailed { .. } => Topic::TurnFailed,
            BusMessage::SecurityBlocked { .. } => Topic::SecurityBlocked,
            BusMessage::PersistenceDegraded { .. } => Topic::PersistenceDegraded,
            BusMessage::VoiceStateChanged { .. } => Topic::VoiceStateChanged,
        }
    }
}

type Subscriber = mpsc::Sender<BusMessage>;
type SubscriberMap = Arc<RwLock<HashMap<Topic, Vec<Subscriber>>>>;

/// In-process fan-out of lifecycle events. Slow subscribers drop messages
/// rather than stall the publisher.
pub struct EventBus {
    subscribers: SubscriberMap,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.write().await;
        subs.entry(topic).or_default().push(tx);
        rx
    }

    /// One receiver for every topic.
    pub async fn subscribe_all(&self) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.write().await;
        for topic in Topic::ALL {
            subs.entry(topic).or_default().push(tx.clone());
        }
        rx
    }

    pub async fn publish(&self, msg: BusMessage) -> Result<()> {
        fan_out(&self.subscribers, msg).await
    }

    pub fn publisher(&self) -> BusPublisher {
        BusPublisher {
            subscribers: self.subscribers.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BusPublisher {
    subscribers: SubscriberMap,
}

impl BusPublisher {
    pub async fn publish(&self, msg: BusMessage) -> Result<()> {
        fan_out(&self.subscribers, msg).await
    }
}

async fn fan_out(subscribers: &SubscriberMap, msg: BusMessage) -> Result<()> {
    let topic = Topic::from_message(&msg);
    {
        let subs = subscribers.read().await;
        let Some(targets) = subs.get(&topic) else {
            return Ok(());
        };
        let mut closed = false;
        for tx in targets {
            match tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(?topic, "bus subscriber full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
            }
        }
        if !closed {
            return Ok(());
        }
    }
    let mut subs = subscribers.write().await;
    if let Some(targets) = subs.get_mut(&topic) {
        targets.retain(|tx| !tx.is_closed());
    }
    Ok(())
}
