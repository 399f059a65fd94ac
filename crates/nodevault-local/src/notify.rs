use std::sync::Arc;

use async_trait::async_trait;
use nodevault_core::{
    ClusterChannel, ClusterMessage, InvalidationEvent, InvalidationReason, InvalidationSink, NodeId, NodeTypeId,
    RepositoryPath, StorageError,
};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// In-process cluster channel backed by a tokio broadcast channel.
///
/// Publishing with no subscriber is not an error: notifications are a
/// delivery mechanism, nobody is obliged to listen.
#[derive(Debug, Clone)]
pub struct BroadcastCluster {
    tx: broadcast::Sender<ClusterMessage>,
}

impl BroadcastCluster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterMessage> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastCluster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ClusterChannel for BroadcastCluster {
    fn publish(&self, message: ClusterMessage) -> Result<(), StorageError> {
        if let Err(broadcast::error::SendError(message)) = self.tx.send(message) {
            trace!("No cluster subscribers for {:?}", message);
        }
        Ok(())
    }
}

/// Invalidation sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidation;

#[async_trait]
impl InvalidationSink for NoopInvalidation {
    async fn invalidate(&self, _event: &InvalidationEvent) {}
}

/// Fans a node change out to the local invalidation sink and, when one is
/// configured, to other processes as `HeadInvalidated`.
#[derive(Clone)]
pub struct Notifier {
    invalidation: Arc<dyn InvalidationSink>,
    cluster: Option<Arc<dyn ClusterChannel>>,
}

impl Notifier {
    pub fn new(invalidation: Arc<dyn InvalidationSink>) -> Self {
        Self {
            invalidation,
            cluster: None,
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterChannel>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub async fn node_changed(
        &self,
        node_id: NodeId,
        path: &RepositoryPath,
        node_type_id: NodeTypeId,
        reason: InvalidationReason,
    ) {
        let event = InvalidationEvent {
            node_id,
            path: path.clone(),
            node_type_id,
            reason,
        };
        self.invalidation.invalidate(&event).await;

        if let Some(cluster) = &self.cluster {
            let message = ClusterMessage::HeadInvalidated {
                node_id,
                path: path.clone(),
            };
            if let Err(e) = cluster.publish(message) {
                warn!("Failed to publish head invalidation for {}: {}", path, e);
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(Arc::new(NoopInvalidation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let cluster = BroadcastCluster::new(8);
        let mut rx = cluster.subscribe();
        let message = ClusterMessage::HeadInvalidated {
            node_id: NodeId(3),
            path: RepositoryPath::parse("/Root/A").unwrap(),
        };
        cluster.publish(message.clone()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), message);
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let cluster = BroadcastCluster::new(8);
        let message = ClusterMessage::HeadInvalidated {
            node_id: NodeId(3),
            path: RepositoryPath::parse("/Root/A").unwrap(),
        };
        assert!(cluster.publish(message).is_ok());
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<InvalidationEvent>>,
    }

    #[async_trait]
    impl InvalidationSink for Recorder {
        async fn invalidate(&self, event: &InvalidationEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn test_notifier_fans_out() {
        let recorder = Arc::new(Recorder::default());
        let cluster = Arc::new(BroadcastCluster::new(8));
        let mut rx = cluster.subscribe();
        let notifier = Notifier::new(recorder.clone()).with_cluster(cluster);
        let path = RepositoryPath::parse("/Root/A").unwrap();

        notifier
            .node_changed(NodeId(3), &path, NodeTypeId(7), InvalidationReason::Deleted)
            .await;

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![InvalidationEvent {
                node_id: NodeId(3),
                path: path.clone(),
                node_type_id: NodeTypeId(7),
                reason: InvalidationReason::Deleted,
            }]
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ClusterMessage::HeadInvalidated {
                node_id: NodeId(3),
                path,
            }
        );
    }
}
