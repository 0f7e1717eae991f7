use tokio::sync::broadcast;

/// A change to the catalog worth telling downstream consumers about.
///
/// Search indexing and similar consumers subscribe to these instead of
/// being wired into the upload path.
#[derive(Debug, Clone)]
pub enum CatalogChange {
    FileCommitted {
        file_id: String,
        directory_id: String,
        project_id: String,
    },
}

/// Fan-out publisher for catalog changes.
///
/// Publishing never fails the caller; with no subscribers the event is
/// dropped.
#[derive(Debug, Clone)]
pub struct ChangePublisher {
    tx: broadcast::Sender<CatalogChange>,
}

impl ChangePublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        ChangePublisher { tx }
    }

    pub fn publish(&self, change: CatalogChange) {
        // Err just means nobody is listening right now.
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogChange> {
        self.tx.subscribe()
    }
}

impl Default for ChangePublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_committed_files() {
        let publisher = ChangePublisher::new();
        let mut rx = publisher.subscribe();

        publisher.publish(CatalogChange::FileCommitted {
            file_id: "f1".to_string(),
            directory_id: "d1".to_string(),
            project_id: "p1".to_string(),
        });

        match rx.recv().await.unwrap() {
            CatalogChange::FileCommitted { file_id, .. } => assert_eq!(file_id, "f1"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let publisher = ChangePublisher::new();
        publisher.publish(CatalogChange::FileCommitted {
            file_id: "f1".to_string(),
            directory_id: "d1".to_string(),
            project_id: "p1".to_string(),
        });
    }
}
