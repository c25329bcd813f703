//! Event publication and filtered subscriptions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use tranche_core::{EscrowEvent, EventType};
use uuid::Uuid;

/// Number of recent events kept for polling consumers.
const RECENT_CAPACITY: usize = 256;

/// Sink for domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event. Delivery is at-least-once.
    async fn publish(&self, event: EscrowEvent);
}

/// Filter for subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Event types to receive. `None` receives all.
    pub types: Option<Vec<EventType>>,

    /// Only events about this milestone or request.
    pub subject_id: Option<Uuid>,
}

impl EventFilter {
    /// Create a filter for specific event types.
    pub fn types(types: Vec<EventType>) -> Self {
        Self {
            types: Some(types),
            ..Default::default()
        }
    }

    /// Create a filter for one subject.
    pub fn subject(subject_id: Uuid) -> Self {
        Self {
            subject_id: Some(subject_id),
            ..Default::default()
        }
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &EscrowEvent) -> bool {
        if let Some(ref types) = self.types {
            if !types.contains(&event.event_type()) {
                return false;
            }
        }

        if let Some(subject) = self.subject_id {
            if event.kind.subject_id() != subject {
                return false;
            }
        }

        true
    }
}

/// A subscription to escrow events.
pub struct EventSubscription {
    /// Unique ID for this subscription.
    pub id: Uuid,

    /// Filter for this subscription.
    pub filter: EventFilter,

    receiver: broadcast::Receiver<EscrowEvent>,
}

impl EventSubscription {
    /// Wait for the next matching event.
    ///
    /// Returns `None` once the publisher is dropped. Lagged receivers skip
    /// the missed events and keep going.
    pub async fn next(&mut self) -> Option<EscrowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subscription = %self.id, skipped, "Subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Broadcast publisher with filtered subscriptions.
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<EscrowEvent>,
    subscriptions: Arc<RwLock<HashMap<Uuid, EventFilter>>>,
    recent: Arc<RwLock<VecDeque<EscrowEvent>>>,
}

impl BroadcastPublisher {
    /// Create a new publisher.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self {
            sender,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            recent: Arc::new(RwLock::new(VecDeque::with_capacity(RECENT_CAPACITY))),
        }
    }

    /// Subscribe to events with a filter.
    pub async fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let id = Uuid::new_v4();
        let receiver = self.sender.subscribe();

        let mut subs = self.subscriptions.write().await;
        subs.insert(id, filter.clone());

        EventSubscription { id, filter, receiver }
    }

    /// Unsubscribe.
    pub async fn unsubscribe(&self, id: Uuid) {
        let mut subs = self.subscriptions.write().await;
        subs.remove(&id);
    }

    /// Get the number of active subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Most recent events matching `filter`, oldest first.
    pub async fn recent(&self, filter: &EventFilter, limit: usize) -> Vec<EscrowEvent> {
        let recent = self.recent.read().await;
        let matching: Vec<EscrowEvent> = recent
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: EscrowEvent) {
        debug!(event_id = %event.event_id, event_type = ?event.event_type(), "Publishing event");

        {
            let mut recent = self.recent.write().await;
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        // No receivers is not an error.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tranche_core::EventKind;

    fn expired(request_id: Uuid) -> EscrowEvent {
        EscrowEvent::new(EventKind::RequestExpired { request_id })
    }

    #[test]
    fn test_filter_types() {
        let filter = EventFilter::types(vec![EventType::RequestExpired]);
        assert!(filter.matches(&expired(Uuid::new_v4())));

        let approved = EscrowEvent::new(EventKind::PaymentApproved {
            request_id: Uuid::new_v4(),
            automatic: true,
        });
        assert!(!filter.matches(&approved));
    }

    #[test]
    fn test_filter_subject() {
        let request_id = Uuid::new_v4();
        let filter = EventFilter::subject(request_id);
        assert!(filter.matches(&expired(request_id)));
        assert!(!filter.matches(&expired(Uuid::new_v4())));
    }

    #[tokio::test]
    async fn test_subscription_receives_matching_events() {
        let publisher = BroadcastPublisher::new();
        let target = Uuid::new_v4();
        let mut sub = publisher.subscribe(EventFilter::subject(target)).await;
        assert_eq!(publisher.subscription_count().await, 1);

        publisher.publish(expired(Uuid::new_v4())).await;
        publisher.publish(expired(target)).await;

        let received = sub.next().await.unwrap();
        assert_eq!(received.kind.subject_id(), target);

        publisher.unsubscribe(sub.id).await;
        assert_eq!(publisher.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_recent_is_bounded() {
        let publisher = BroadcastPublisher::new();
        for _ in 0..(RECENT_CAPACITY + 10) {
            publisher.publish(expired(Uuid::new_v4())).await;
        }
        let all = publisher.recent(&EventFilter::default(), usize::MAX).await;
        assert_eq!(all.len(), RECENT_CAPACITY);
        assert_eq!(publisher.recent(&EventFilter::default(), 5).await.len(), 5);
    }
}
