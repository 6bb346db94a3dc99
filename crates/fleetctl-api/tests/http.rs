//! Router integration tests against the simulated cloud.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use fleetctl_api::build_router;
use fleetctl_cloud::{CloudProvider, SimCloud};
use fleetctl_config::FleetConfig;
use fleetctl_engine::{ControlState, Engine};
use fleetctl_ledger::Ledger;
use fleetctl_metrics::Registry;

fn test_config() -> FleetConfig {
    serde_yaml::from_str(
        r#"
kind: FleetConfig
metadata:
  name: web
spec:
  compartmentId: ocid1.compartment.sim..a
  imageId: ocid1.image.sim..b
  shape: VM.Standard.E4
  subnetId: ocid1.subnet.sim..c
  auth:
    method: simulated
  instances:
    - name: web
      count: 2
"#,
    )
    .unwrap()
}

struct Harness {
    router: Router,
    engine: Arc<Engine>,
    cloud: Arc<SimCloud>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(SimCloud::new());
    let ledger = Arc::new(Ledger::new(dir.path().join("state.json")));
    let metrics = Arc::new(Registry::new());
    let engine = Arc::new(Engine::new(
        test_config(),
        Arc::clone(&cloud) as Arc<dyn CloudProvider>,
        ledger,
        metrics,
    ));
    let control = Arc::new(ControlState::new());
    Harness {
        router: build_router(Arc::clone(&engine), control),
        engine,
        cloud,
        _dir: dir,
    }
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_answers_ok() {
    let h = harness();
    let resp = h
        .router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_is_plain_text() {
    let h = harness();
    let resp = h
        .router
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("Status for fleet \"web\""));
    assert!(text.contains("Local active:"));
}

#[tokio::test]
async fn metrics_carries_the_composite_shape() {
    let h = harness();
    let resp = h
        .router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let doc = body_json(resp).await;
    assert_eq!(doc["fleet"], "web");
    assert_eq!(doc["localActive"], 0);
    assert_eq!(doc["remoteActive"], 0);
    assert!(doc["timestamp"].is_string());
    assert!(doc["control"].is_object());
    assert!(doc["actions"].is_object());
    assert_eq!(doc["minimums"]["total"], 2);
}

#[tokio::test]
async fn scale_is_fire_and_forget() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/scale")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"desired": 2}"#))
        .unwrap();
    let resp = h.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    // The operation runs in the background; wait for it to land.
    let mut remote = 0;
    for _ in 0..50 {
        remote = h
            .cloud
            .list_instances_by_fleet("a", "web")
            .await
            .unwrap()
            .len();
        if remote == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(remote, 2);
}

#[tokio::test]
async fn scale_rejects_negative_and_malformed_bodies() {
    let h = harness();

    let req = Request::builder()
        .method("POST")
        .uri("/scale")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"desired": -1}"#))
        .unwrap();
    let resp = h.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = Request::builder()
        .method("POST")
        .uri("/scale")
        .header("content-type", "application/json")
        .body(Body::from("not json"))
        .unwrap();
    let resp = h.router.clone().oneshot(req).await.unwrap();
    assert!(resp.status().is_client_error());

    // Nothing was enqueued or launched.
    assert!(h.engine.metrics().snapshot().scale_queue.is_empty());
    assert!(h
        .cloud
        .list_instances_by_fleet("a", "web")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn scale_enqueues_for_the_queue_badge() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/scale")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"desired": 3}"#))
        .unwrap();
    let resp = h.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    // Once the operation starts it pops its own entry; converged means
    // the queue head was consumed.
    for _ in 0..50 {
        if h.engine.metrics().snapshot().scale_queue.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(h.engine.metrics().snapshot().scale_queue.is_empty());
}

#[tokio::test]
async fn rolling_restart_and_sync_state_run_synchronously() {
    let h = harness();
    h.engine.scale(2).await.unwrap();

    let resp = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rolling-restart")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        h.cloud.list_instances_by_fleet("a", "web").await.unwrap().len(),
        2
    );

    let resp = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sync-state")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(h.engine.ledger().count_active("web").unwrap(), 2);
}

#[tokio::test]
async fn control_serves_the_loop_snapshot() {
    let h = harness();
    let resp = h
        .router
        .oneshot(Request::builder().uri("/control").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let doc = body_json(resp).await;
    assert_eq!(doc["enabled"], false);
    assert_eq!(doc["loopCount"], 0);
    assert!(doc["lastAction"].is_string());
}

#[tokio::test]
async fn events_is_a_server_sent_event_stream() {
    let h = harness();
    let resp = h
        .router
        .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));
}
