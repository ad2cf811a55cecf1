//! End-to-end extraction through the coordinator, with the OCR bridge and
//! the chat server mocked.

use futures::StreamExt;
use httpmock::{
    Method::{GET, POST},
    MockServer,
};
use rstest::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vision_extract::config::BridgeConfig;
use vision_extract::providers::{
    ChatCompletionProvider, CloudVisionProvider, LocalOcrProvider, Providers,
};
use vision_extract::record_store::{MemoryRecordStore, RecordStore};
use vision_extract::schema::{InboundRequest, RequestDefaults};
use vision_extract::supervisor::{BridgeState, Supervisor, Tier};
use vision_extract::{Coordinator, Frame, Orchestrator};

// 1x1 transparent PNG.
const PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

struct Harness {
    bridge: MockServer,
    llm: MockServer,
    supervisor: Arc<Supervisor>,
    store: MemoryRecordStore,
    coordinator: Coordinator,
    _root: TempDir,
}

/// Bridge config pointing at the mock server; never frees ports, since
/// that would hit the test process itself.
fn bridge_config(root: &std::path::Path, bridge: &MockServer) -> BridgeConfig {
    let mut config = BridgeConfig::new(root);
    config.host = bridge.address().ip().to_string();
    config.port = bridge.address().port();
    config.free_port_on_stop = false;
    config.poll_interval = Duration::from_millis(20);
    config.poll_attempts = 100;
    config.command = Some(vec![
        "sh".to_string(),
        "-c".to_string(),
        "sleep 30".to_string(),
    ]);
    config
}

#[fixture]
async fn harness() -> Harness {
    let bridge = MockServer::start_async().await;
    let llm = MockServer::start_async().await;
    let root = tempfile::tempdir().unwrap();
    let client = reqwest::Client::new();

    let supervisor = Arc::new(Supervisor::new(
        bridge_config(root.path(), &bridge),
        client.clone(),
    ));
    let providers = Providers {
        cloud_vision: Arc::new(CloudVisionProvider::new(client.clone(), Duration::from_secs(10))),
        chat: Arc::new(ChatCompletionProvider::new(client.clone(), Duration::from_secs(10))),
        local_ocr: Arc::new(LocalOcrProvider::new(Arc::clone(&supervisor), client)),
    };
    let store = MemoryRecordStore::new();
    let coordinator = Coordinator::new(Orchestrator::new(providers), Arc::new(store.clone()));

    Harness {
        bridge,
        llm,
        supervisor,
        store,
        coordinator,
        _root: root,
    }
}

fn request(h: &Harness, body: serde_json::Value) -> vision_extract::schema::ValidatedRequest {
    let inbound: InboundRequest = serde_json::from_value(body).unwrap();
    inbound
        .validate(&RequestDefaults {
            base_url: h.llm.base_url(),
            api_key: None,
        })
        .unwrap()
}

async fn mock_bridge_health(h: &Harness, tier: &str) {
    h.bridge
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200)
                .json_body(json!({"status": "ok", "busy": false, "tier": tier, "model": "PP-OCRv4"}));
        })
        .await;
}

fn messages(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Log { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

#[rstest]
#[tokio::test]
async fn test_chained_extraction_is_persisted(#[future] harness: Harness) {
    let h = harness.await;
    mock_bridge_health(&h, "eco").await;
    let ocr = h
        .bridge
        .mock_async(|when, then| {
            when.method(POST)
                .path("/ocr")
                .json_body(json!({"image_base64": PIXEL_PNG}));
            then.status(200).json_body(json!({"result": "Coffee $4.50"}));
        })
        .await;
    let chat = h
        .llm
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_contains("Coffee $4.50");
            then.status(200).body(concat!(
                "{\"message\":{\"content\":\"{\\\"title\\\":\\\"Coffee\\\",\\\"amount\\\":4.5}\"},\"done\":false}\n",
                "{\"message\":{\"content\":\"\"},\"done\":true}\n",
            ));
        })
        .await;

    let validated = request(
        &h,
        json!({"image": PIXEL_PNG, "model": "llama3.2", "strategy": "B"}),
    );
    let frames: Vec<Frame> = h.coordinator.run(validated).collect().await;

    ocr.assert_async().await;
    chat.assert_async().await;
    assert_eq!(
        frames.last(),
        Some(&Frame::final_event(json!({"title": "Coffee", "amount": 4.5})))
    );
    assert_eq!(frames.iter().filter(|f| f.is_terminal()).count(), 1);

    // Stage one's frames all come before stage two's.
    let tags: Vec<&str> = frames.iter().filter_map(Frame::tag).collect();
    let last_ocr = tags.iter().rposition(|t| *t == "local_ocr").unwrap();
    let first_chat = tags.iter().position(|t| *t == "chat").unwrap();
    assert!(last_ocr < first_chat);

    let records = h.store.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event["title"], "Coffee");
}

#[rstest]
#[tokio::test]
async fn test_direct_ocr_failure_is_not_persisted(#[future] harness: Harness) {
    let h = harness.await;
    mock_bridge_health(&h, "eco").await;
    h.bridge
        .mock_async(|when, then| {
            when.method(POST).path("/ocr");
            then.status(500).body("engine crashed");
        })
        .await;

    let validated = request(&h, json!({"image": PIXEL_PNG, "model": "paddleocr"}));
    let frames: Vec<Frame> = h.coordinator.run(validated).collect().await;

    assert!(matches!(frames.last(), Some(Frame::Error { message }) if message.contains("engine crashed")));
    assert!(h.store.is_empty());
}

#[rstest]
#[tokio::test]
async fn test_direct_ocr_final_payload(#[future] harness: Harness) {
    let h = harness.await;
    mock_bridge_health(&h, "eco").await;
    h.bridge
        .mock_async(|when, then| {
            when.method(POST).path("/ocr");
            then.status(200).json_body(json!({"result": "HELLO"}));
        })
        .await;

    let validated = request(&h, json!({"image": PIXEL_PNG, "model": "paddleocr"}));
    let frames: Vec<Frame> = h.coordinator.run(validated).collect().await;

    assert_eq!(
        frames.last(),
        Some(&Frame::final_event(json!({
            "extracted_text": "HELLO",
            "tier": "eco",
            "provider": "local_ocr"
        })))
    );
    assert_eq!(h.store.len(), 1);
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn test_vision_language_model_switches_tier(#[future] harness: Harness) {
    let h = harness.await;
    // The bridge keeps reporting eco; the switch converges on readiness.
    mock_bridge_health(&h, "eco").await;
    h.bridge
        .mock_async(|when, then| {
            when.method(POST).path("/ocr");
            then.status(200).json_body(json!({"result": "Concert 8pm"}));
        })
        .await;

    let validated = request(&h, json!({"image": PIXEL_PNG, "model": "paddleocr-vl"}));
    let frames: Vec<Frame> = h.coordinator.run(validated).collect().await;

    assert!(messages(&frames)
        .iter()
        .any(|m| m == "Switching bridge from eco to lite tier"));
    assert_eq!(frames.last().unwrap(), &Frame::final_event(json!({
        "extracted_text": "Concert 8pm",
        "tier": "lite",
        "provider": "local_ocr"
    })));
    assert_eq!(h.supervisor.active_tier(), Tier::Lite);
    assert_eq!(h.supervisor.running_tier().await, Some(Tier::Lite));

    h.supervisor.stop().await;
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn test_repeated_tier_switch_keeps_one_process(#[future] harness: Harness) {
    let h = harness.await;
    mock_bridge_health(&h, "lite").await;

    assert_eq!(h.supervisor.set_active_tier(Tier::Lite).await, BridgeState::Healthy);
    let first = h.supervisor.pid().await.unwrap();

    assert_eq!(h.supervisor.set_active_tier(Tier::Lite).await, BridgeState::Healthy);
    let second = h.supervisor.pid().await.unwrap();

    assert_ne!(first, second);
    assert_eq!(h.supervisor.active_tier(), Tier::Lite);
    assert_eq!(h.supervisor.running_tier().await, Some(Tier::Lite));

    let persisted = std::fs::read_to_string(h.supervisor.config().tier_file()).unwrap();
    assert_eq!(persisted.matches("active_tier").count(), 1);

    let status = h.supervisor.status().await;
    assert!(status.running);
    assert_eq!(status.state, BridgeState::Healthy);

    h.supervisor.stop().await;
    assert_eq!(h.supervisor.state(), BridgeState::Stopped);
    assert!(h.supervisor.pid().await.is_none());
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn test_concurrent_starts_share_one_spawn(#[future] harness: Harness) {
    let h = harness.await;
    mock_bridge_health(&h, "eco").await;

    let (a, b) = tokio::join!(
        h.supervisor.start(Some(Tier::Eco)),
        h.supervisor.start(Some(Tier::Eco))
    );
    assert_eq!(a, BridgeState::Healthy);
    assert_eq!(b, BridgeState::Healthy);

    let launches = h
        .supervisor
        .drain_logs()
        .into_iter()
        .filter(|e| e.message.starts_with("Bridge launched"))
        .count();
    assert_eq!(launches, 1);

    h.supervisor.stop().await;
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn test_local_ocr_starts_bridge_when_not_ready(#[future] harness: Harness) {
    let h = harness.await;
    let mut unavailable = h
        .bridge
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(503);
        })
        .await;
    let ocr = h
        .bridge
        .mock_async(|when, then| {
            when.method(POST).path("/ocr");
            then.status(200).json_body(json!({"result": "Parking 2h"}));
        })
        .await;

    let validated = request(&h, json!({"image": PIXEL_PNG, "model": "paddleocr"}));
    let run = tokio::spawn(h.coordinator.run(validated).collect::<Vec<Frame>>());

    // The bridge only answers once the supervisor has launched it.
    let mut launched = false;
    for _ in 0..100 {
        if h.supervisor.pid().await.is_some() {
            launched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(launched, "bridge was never launched");
    unavailable.delete_async().await;
    mock_bridge_health(&h, "eco").await;

    let frames = run.await.unwrap();
    ocr.assert_async().await;
    assert!(messages(&frames).iter().any(|m| m == "Bridge not ready, starting it"));
    assert_eq!(
        frames.last(),
        Some(&Frame::final_event(json!({
            "extracted_text": "Parking 2h",
            "tier": "eco",
            "provider": "local_ocr"
        })))
    );
    assert_eq!(h.supervisor.state(), BridgeState::Healthy);

    h.supervisor.stop().await;
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn test_bridge_exit_after_ready_is_noticed(#[future] harness: Harness) {
    let h = harness.await;
    mock_bridge_health(&h, "eco").await;

    let mut config = bridge_config(h._root.path(), &h.bridge);
    config.command = Some(vec![
        "sh".to_string(),
        "-c".to_string(),
        "sleep 0.3".to_string(),
    ]);
    let supervisor = Supervisor::new(config, reqwest::Client::new());

    assert_eq!(supervisor.start(Some(Tier::Eco)).await, BridgeState::Healthy);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let status = supervisor.status().await;
    assert!(!status.running);
    assert_eq!(status.state, BridgeState::Failing);
    assert_eq!(supervisor.running_tier().await, None);
    assert_eq!(supervisor.pid().await, None);
    assert!(supervisor
        .drain_logs()
        .iter()
        .any(|e| e.message.starts_with("Bridge exited")));
}
