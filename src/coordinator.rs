//! Extraction coordinator: relays the orchestrated stream and persists the
//! final event.

use futures::StreamExt;
use std::sync::Arc;
use tracing::{error, info};

use crate::codec::Frame;
use crate::orchestrator::Orchestrator;
use crate::providers::FrameStream;
use crate::record_store::RecordStore;
use crate::schema::ValidatedRequest;

#[derive(Clone)]
pub struct Coordinator {
    orchestrator: Orchestrator,
    store: Arc<dyn RecordStore>,
}

impl Coordinator {
    pub fn new(orchestrator: Orchestrator, store: Arc<dyn RecordStore>) -> Self {
        Self {
            orchestrator,
            store,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// The event is saved before the `final` frame is yielded, so it is
    /// persisted even if the caller drops the stream right after reading it.
    /// A failed save is logged and the frame is still delivered.
    pub fn run(&self, validated: ValidatedRequest) -> FrameStream {
        let store = Arc::clone(&self.store);
        let mut frames = self.orchestrator.run(validated);

        Box::pin(async_stream::stream! {
            while let Some(frame) = frames.next().await {
                if let Frame::Final { event } = &frame {
                    match store.save(event.clone()).await {
                        Ok(id) => info!("Saved extraction result as {}", id),
                        Err(e) => error!("Failed to save extraction result: {:#}", e),
                    }
                }
                yield frame;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{providers, ScriptedProvider};
    use crate::record_store::{MemoryRecordStore, StoredRecord};
    use crate::schema::{ExtractionRequest, ProviderConfig, Strategy};
    use serde_json::{json, Value};

    struct FailingStore;

    #[async_trait::async_trait]
    impl RecordStore for FailingStore {
        async fn save(&self, _event: Value) -> anyhow::Result<String> {
            anyhow::bail!("disk full")
        }

        async fn list(&self) -> anyhow::Result<Vec<StoredRecord>> {
            Ok(Vec::new())
        }
    }

    fn coordinator(chat_frames: Vec<Frame>, store: Arc<dyn RecordStore>) -> Coordinator {
        let chat = ScriptedProvider::new("chat", chat_frames);
        let unused = || ScriptedProvider::new("unused", vec![Frame::error("should not run")]);
        Coordinator::new(Orchestrator::new(providers(unused(), chat, unused())), store)
    }

    fn request() -> ValidatedRequest {
        ValidatedRequest {
            request: ExtractionRequest {
                ocr_text: Some("Team lunch Friday noon".into()),
                ..Default::default()
            },
            provider: ProviderConfig::new("http://localhost:11434", "llama3.2"),
            strategy: Strategy::Direct,
        }
    }

    #[tokio::test]
    async fn test_saves_final_once() {
        let store = MemoryRecordStore::new();
        let coordinator = coordinator(
            vec![
                Frame::log("chat", "start"),
                Frame::final_event(json!({"title": "Team lunch"})),
            ],
            Arc::new(store.clone()),
        );

        let frames: Vec<Frame> = coordinator.run(request()).collect().await;

        assert_eq!(frames.len(), 2);
        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, json!({"title": "Team lunch"}));
    }

    #[tokio::test]
    async fn test_never_saves_on_error() {
        let store = MemoryRecordStore::new();
        let coordinator = coordinator(
            vec![Frame::error("Model response did not contain valid JSON")],
            Arc::new(store.clone()),
        );

        let frames: Vec<Frame> = coordinator.run(request()).collect().await;

        assert_eq!(frames, vec![Frame::error("Model response did not contain valid JSON")]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_failure_still_delivers_final() {
        let coordinator = coordinator(
            vec![Frame::final_event(json!({"title": "Team lunch"}))],
            Arc::new(FailingStore),
        );

        let frames: Vec<Frame> = coordinator.run(request()).collect().await;
        assert_eq!(frames, vec![Frame::final_event(json!({"title": "Team lunch"}))]);
    }

    #[tokio::test]
    async fn test_saved_before_final_is_yielded() {
        let store = MemoryRecordStore::new();
        let coordinator = coordinator(
            vec![Frame::final_event(json!({"title": "Team lunch"}))],
            Arc::new(store.clone()),
        );

        let mut stream = coordinator.run(request());
        let first = stream.next().await.unwrap();
        assert!(first.is_terminal());
        // Caller stops reading here; the record is already there.
        drop(stream);
        assert_eq!(store.len(), 1);
    }
}
