//! Fires N tasks at a running server and waits for all of them to finish.

use std::time::{Duration, Instant};

#[tokio::main]
async fn main() {
    let n: usize = std::env::var("N").ok().and_then(|v| v.parse().ok()).unwrap_or(16);
    let prompt = std::env::var("PROMPT").unwrap_or_else(|_| "Simply put, the theory of relativity states that ".into());
    let base = std::env::var("URL").unwrap_or_else(|_| "http://127.0.0.1:8080".into());
    let client = reqwest::Client::new();
    let start = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..n {
        let c = client.clone();
        let p = prompt.clone();
        let base = base.clone();
        tasks.push(tokio::spawn(async move {
            let body = serde_json::json!({"prompt": p});
            let resp = c.post(format!("{base}/v1/tasks")).json(&body).send().await.ok()?;
            if resp.status() != 202 {
                return Some("REJECTED".to_string());
            }
            let task: serde_json::Value = resp.json().await.ok()?;
            let id = task["task_id"].as_str()?.to_string();
            loop {
                let task: serde_json::Value =
                    c.get(format!("{base}/v1/tasks/{id}")).send().await.ok()?.json().await.ok()?;
                match task["status"].as_str()? {
                    s @ ("COMPLETE" | "FAILED") => return Some(s.to_string()),
                    _ => tokio::time::sleep(Duration::from_millis(250)).await,
                }
            }
        }));
    }
    let mut complete = 0;
    for t in tasks {
        if let Ok(Some(status)) = t.await {
            if status == "COMPLETE" { complete += 1; }
        }
    }
    println!("{complete}/{n} tasks complete in {:.2}s", start.elapsed().as_secs_f32());
}
