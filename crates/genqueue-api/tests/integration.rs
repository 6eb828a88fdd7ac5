use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use axum::Router;
use genqueue_api::{app, build_state, router};
use genqueue_backend::mock::MockBackend;
use genqueue_backend::{ForwardOutput, InferenceBackend, LoadParams, ModelHandle, SequenceState, SpecialTokens};
use genqueue_common::config::{AppConfig, BackendKind};

fn test_config() -> AppConfig {
    let root = std::env::temp_dir().join(format!("genqueue-api-{:016x}", rand::random::<u64>()));
    let mut cfg = AppConfig::default();
    cfg.model.backend = BackendKind::Mock;
    cfg.volumes[0].path = root.join("weights");
    cfg.task_queue.output_dir = root.join("outputs");
    cfg.generation.seed = Some(3);
    cfg
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap(); });
    format!("http://{}:{}", addr.ip(), addr.port())
}

async fn spawn_server() -> String {
    serve(app(test_config()).unwrap()).await
}

/// Mock backend whose forward passes wait until the gate opens.
struct GatedBackend {
    inner: MockBackend,
    open: Arc<(Mutex<bool>, Condvar)>,
}

impl GatedBackend {
    fn new() -> (Self, Arc<(Mutex<bool>, Condvar)>) {
        let open = Arc::new((Mutex::new(false), Condvar::new()));
        (Self { inner: MockBackend::new(), open: open.clone() }, open)
    }
}

fn open_gate(gate: &(Mutex<bool>, Condvar)) {
    *gate.0.lock().unwrap() = true;
    gate.1.notify_all();
}

impl InferenceBackend for GatedBackend {
    fn name(&self) -> &'static str { "gated" }
    fn needs_checkpoint(&self) -> bool { false }
    fn load_model(&self, path: &Path, params: LoadParams) -> genqueue_common::Result<ModelHandle> {
        self.inner.load_model(path, params)
    }
    fn is_loaded(&self) -> bool { self.inner.is_loaded() }
    fn tokenize(&self, text: &str, add_bos: bool) -> genqueue_common::Result<Vec<u32>> {
        self.inner.tokenize(text, add_bos)
    }
    fn detokenize(&self, tokens: &[u32], skip_special: bool) -> genqueue_common::Result<String> {
        self.inner.detokenize(tokens, skip_special)
    }
    fn forward(&self, sequences: &[SequenceState]) -> genqueue_common::Result<ForwardOutput> {
        let (lock, cv) = &*self.open;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cv.wait(open).unwrap();
        }
        drop(open);
        self.inner.forward(sequences)
    }
    fn special_tokens(&self) -> SpecialTokens { self.inner.special_tokens() }
    fn vocab_size(&self) -> usize { self.inner.vocab_size() }
}

async fn task_status(client: &reqwest::Client, base: &str, task_id: &str) -> String {
    let task: serde_json::Value = client
        .get(format!("{}/v1/tasks/{}", base, task_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    task["status"].as_str().unwrap().to_string()
}

async fn wait_for_status(client: &reqwest::Client, base: &str, task_id: &str, want: &str) {
    for _ in 0..300 {
        if task_status(client, base, task_id).await == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} never reached {want}");
}

#[tokio::test]
async fn submit_poll_and_fetch_output() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let body = serde_json::json!({"prompt": "Simply put, the theory of relativity states that "});
    let r = client.post(format!("{}/v1/tasks", base)).json(&body).send().await.unwrap();
    assert_eq!(r.status(), 202);
    let submitted: serde_json::Value = r.json().await.unwrap();
    let task_id = submitted["task_id"].as_str().unwrap().to_string();
    assert_eq!(submitted["status"], "PENDING");

    let mut status = String::new();
    for _ in 0..300 {
        let task: serde_json::Value = client
            .get(format!("{}/v1/tasks/{}", base, task_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        status = task["status"].as_str().unwrap().to_string();
        if status == "COMPLETE" || status == "FAILED" {
            assert_eq!(task["output_urls"][0], format!("/v1/tasks/{}/outputs/output.txt", task_id));
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, "COMPLETE");

    let r = client.get(format!("{}/v1/tasks/{}/outputs/output.txt", base, task_id)).send().await.unwrap();
    assert_eq!(r.status(), 200);
    let text = r.text().await.unwrap();
    assert!(text.starts_with("Simply put, the theory of relativity states that"));
    assert!(text.len() > body["prompt"].as_str().unwrap().len());

    let r = client.get(format!("{}/v1/tasks/{}/outputs/other.txt", base, task_id)).send().await.unwrap();
    assert_eq!(r.status(), 404);

    let list: Vec<serde_json::Value> = client.get(format!("{}/v1/tasks", base)).send().await.unwrap().json().await.unwrap();
    assert_eq!(list.len(), 1);

    // events for a finished task deliver the final record and close
    let r = client.get(format!("{}/v1/tasks/{}/events", base, task_id)).send().await.unwrap();
    assert!(r.status().is_success());
    let events = r.text().await.unwrap();
    assert!(events.contains("COMPLETE"));
}

#[tokio::test]
async fn errors_health_metrics_and_sync_run() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let r = client.get(format!("{}/v1/tasks/nope", base)).send().await.unwrap();
    assert_eq!(r.status(), 404);
    let err: serde_json::Value = r.json().await.unwrap();
    assert!(err["error"].as_str().unwrap().contains("nope"));

    let r = client.post(format!("{}/v1/tasks", base)).json(&serde_json::json!({})).send().await.unwrap();
    assert_eq!(r.status(), 422);

    let r = client.get(format!("{}/healthz", base)).send().await.unwrap();
    assert!(r.status().is_success());

    let r = client.post(format!("{}/v1/run", base)).json(&serde_json::json!({"prompt": "Hello"})).send().await.unwrap();
    assert!(r.status().is_success());
    let run: serde_json::Value = r.json().await.unwrap();
    assert_eq!(run["status"], "COMPLETE");
    assert!(run["text"].as_str().unwrap().starts_with("Hello"));

    // the sync run loaded the model
    let r = client.get(format!("{}/readyz", base)).send().await.unwrap();
    assert!(r.status().is_success());

    let r = client.get(format!("{}/metrics", base)).send().await.unwrap();
    assert!(r.status().is_success());
    let metrics = r.text().await.unwrap();
    assert!(metrics.contains("genqueue_tasks_finished_total"));

    let r = client.get(format!("{}/openapi.json", base)).send().await.unwrap();
    let spec: serde_json::Value = r.json().await.unwrap();
    assert!(spec["paths"]["/v1/tasks"].is_object());
}

#[tokio::test]
async fn busy_queue_answers_conflict_and_unavailable() {
    let mut cfg = test_config();
    cfg.task_queue.workers = 1;
    cfg.task_queue.max_pending = 1;
    cfg.generation.num_beams = 1;
    cfg.generation.max_new_tokens = 4;
    let (backend, gate) = GatedBackend::new();
    let base = serve(router(build_state(cfg, Arc::new(backend)).unwrap())).await;
    let client = reqwest::Client::new();
    let submit = |prompt: &'static str| {
        client
            .post(format!("{}/v1/tasks", base))
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
    };

    let r = submit("first").await.unwrap();
    assert_eq!(r.status(), 202);
    let first: serde_json::Value = r.json().await.unwrap();
    let first_id = first["task_id"].as_str().unwrap().to_string();
    wait_for_status(&client, &base, &first_id, "RUNNING").await;

    // outputs of a task that has not finished are a conflict
    let r = client.get(format!("{}/v1/tasks/{}/outputs/output.txt", base, first_id)).send().await.unwrap();
    assert_eq!(r.status(), 409);

    let r = submit("second").await.unwrap();
    assert_eq!(r.status(), 202);
    let r = submit("third").await.unwrap();
    assert_eq!(r.status(), 503);
    let err: serde_json::Value = r.json().await.unwrap();
    assert!(err["error"].as_str().unwrap().contains("full"));

    let metrics = client.get(format!("{}/metrics", base)).send().await.unwrap().text().await.unwrap();
    assert!(metrics.contains("genqueue_tasks{status=\"RUNNING\"}"));
    assert!(metrics.contains("genqueue_tasks{status=\"PENDING\"}"));

    open_gate(&gate);
    wait_for_status(&client, &base, &first_id, "COMPLETE").await;
    let r = client.get(format!("{}/v1/tasks/{}/outputs/output.txt", base, first_id)).send().await.unwrap();
    assert_eq!(r.status(), 200);
    assert!(r.text().await.unwrap().starts_with("first"));
}
