//! In-process fanout bus. One broadcast topic per program id plus a
//! firehose topic for the webhook dispatcher; delivery never blocks
//! producers, and a consumer that falls behind its bounded backlog loses
//! the overflowed messages rather than stalling the pipeline.

use crate::metrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

pub const DEFAULT_BACKLOG: usize = 1000;

#[derive(Debug, Clone)]
pub struct FanoutMessage {
    pub program_id: String,
    pub event_name: String,
    pub slot: u64,
    pub tx_signature: String,
    pub data: Map<String, Value>,
    /// Tenant ids subscribed to this program, attached by the writer.
    pub subscribers: Vec<Uuid>,
    pub timestamp: DateTime<Utc>,
}

/// Filter for a typed subscription stream.
#[derive(Debug, Clone, Default)]
pub struct StreamFilter {
    pub programs: Vec<String>,
    /// Empty list matches every event name.
    pub events: Vec<String>,
    /// Equality on top-level data fields.
    pub fields: Map<String, Value>,
}

impl StreamFilter {
    pub fn matches(&self, message: &FanoutMessage) -> bool {
        if !self.events.is_empty() && !self.events.contains(&message.event_name) {
            return false;
        }
        self.fields
            .iter()
            .all(|(key, expected)| message.data.get(key) == Some(expected))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdate {
    pub event: String,
    pub program: String,
    pub slot: u64,
    pub tx_signature: String,
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl From<FanoutMessage> for SubscriptionUpdate {
    fn from(message: FanoutMessage) -> Self {
        Self {
            event: message.event_name,
            program: message.program_id,
            slot: message.slot,
            tx_signature: message.tx_signature,
            data: message.data,
            timestamp: message.timestamp,
        }
    }
}

pub struct FanoutBus {
    backlog: usize,
    topics: RwLock<HashMap<String, broadcast::Sender<FanoutMessage>>>,
    firehose: broadcast::Sender<FanoutMessage>,
}

impl FanoutBus {
    pub fn new(backlog: usize) -> Self {
        let (firehose, _) = broadcast::channel(backlog.max(1));
        Self {
            backlog: backlog.max(1),
            topics: RwLock::new(HashMap::new()),
            firehose,
        }
    }

    /// Non-blocking publish; messages to topics with no subscriber are
    /// dropped on the floor.
    pub fn publish(&self, message: FanoutMessage) {
        let topic = {
            let topics = self.topics.read();
            topics.get(&message.program_id).cloned()
        };
        if let Some(topic) = topic {
            let _ = topic.send(message.clone());
        }
        let _ = self.firehose.send(message);
    }

    pub fn subscribe(&self, program_id: &str) -> broadcast::Receiver<FanoutMessage> {
        let mut topics = self.topics.write();
        topics
            .entry(program_id.to_string())
            .or_insert_with(|| broadcast::channel(self.backlog).0)
            .subscribe()
    }

    /// Every message of every program; used by the webhook dispatcher.
    pub fn subscribe_all(&self) -> broadcast::Receiver<FanoutMessage> {
        self.firehose.subscribe()
    }

    /// Typed subscription stream for a tenant: messages of the requested
    /// programs, filtered by event name and top-level field equality, in
    /// delivery order. A slow consumer loses messages past the backlog.
    pub fn subscribe_stream(
        self: &Arc<Self>,
        tenant_id: Uuid,
        filter: StreamFilter,
    ) -> mpsc::Receiver<SubscriptionUpdate> {
        let (tx, rx) = mpsc::channel(self.backlog);
        for program in &filter.programs {
            let mut source = self.subscribe(program);
            let tx = tx.clone();
            let filter = filter.clone();
            tokio::spawn(async move {
                loop {
                    match source.recv().await {
                        Ok(message) => {
                            if !message.subscribers.contains(&tenant_id)
                                || !filter.matches(&message)
                            {
                                continue;
                            }
                            match tx.try_send(message.into()) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    metrics::FANOUT_DROPPED_TOTAL.inc();
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => break,
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            metrics::FANOUT_DROPPED_TOTAL.inc_by(missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(program: &str, event: &str, slot: u64, tenant: Uuid) -> FanoutMessage {
        let mut data = Map::new();
        data.insert("amount".to_string(), json!(slot * 10));
        FanoutMessage {
            program_id: program.to_string(),
            event_name: event.to_string(),
            slot,
            tx_signature: format!("sig{slot}"),
            data,
            subscribers: vec![tenant],
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = Arc::new(FanoutBus::new(16));
        let tenant = Uuid::new_v4();
        let mut rx = bus.subscribe("prog");

        for slot in [10, 11, 12] {
            bus.publish(message("prog", "swap_event", slot, tenant));
        }
        let mut slots = Vec::new();
        for _ in 0..3 {
            slots.push(rx.recv().await.unwrap().slot);
        }
        assert_eq!(slots, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_messages_without_reordering() {
        let bus = Arc::new(FanoutBus::new(2));
        let tenant = Uuid::new_v4();
        let mut rx = bus.subscribe("prog");

        for slot in 1..=5 {
            bus.publish(message("prog", "swap_event", slot, tenant));
        }
        // backlog of 2: the receiver lagged and resumes at the oldest
        // retained message
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().slot, 4);
        assert_eq!(rx.recv().await.unwrap().slot, 5);
    }

    #[tokio::test]
    async fn stream_filters_by_tenant_event_and_fields() {
        let bus = Arc::new(FanoutBus::new(16));
        let tenant = Uuid::new_v4();
        let other_tenant = Uuid::new_v4();

        let mut stream = bus.subscribe_stream(
            tenant,
            StreamFilter {
                programs: vec!["prog".to_string()],
                events: vec!["swap_event".to_string()],
                fields: Map::new(),
            },
        );

        bus.publish(message("prog", "swap_event", 1, tenant));
        bus.publish(message("prog", "fee_event", 2, tenant)); // wrong event
        bus.publish(message("prog", "swap_event", 3, other_tenant)); // wrong tenant
        bus.publish(message("prog", "swap_event", 4, tenant));

        assert_eq!(stream.recv().await.unwrap().slot, 1);
        assert_eq!(stream.recv().await.unwrap().slot, 4);
    }

    #[tokio::test]
    async fn empty_event_filter_matches_every_event() {
        let tenant = Uuid::new_v4();
        let filter = StreamFilter::default();
        assert!(filter.matches(&message("p", "anything", 1, tenant)));

        let named = StreamFilter {
            events: vec!["swap_event".to_string()],
            ..Default::default()
        };
        assert!(named.matches(&message("p", "swap_event", 1, tenant)));
        assert!(!named.matches(&message("p", "fee_event", 1, tenant)));
    }

    #[tokio::test]
    async fn field_filters_compare_top_level_values() {
        let tenant = Uuid::new_v4();
        let mut fields = Map::new();
        fields.insert("amount".to_string(), json!(20));
        let filter = StreamFilter {
            fields,
            ..Default::default()
        };
        // message data sets amount = slot * 10
        assert!(filter.matches(&message("p", "e", 2, tenant)));
        assert!(!filter.matches(&message("p", "e", 3, tenant)));
    }

    #[tokio::test]
    async fn firehose_sees_all_programs() {
        let bus = Arc::new(FanoutBus::new(16));
        let tenant = Uuid::new_v4();
        let mut all = bus.subscribe_all();
        bus.publish(message("prog_a", "e", 1, tenant));
        bus.publish(message("prog_b", "e", 2, tenant));
        assert_eq!(all.recv().await.unwrap().program_id, "prog_a");
        assert_eq!(all.recv().await.unwrap().program_id, "prog_b");
    }
}
