//! Built-in iteration functions for the bundled demo targets.
//!
//! | name          | target                                                   |
//! |---------------|----------------------------------------------------------|
//! | `hello`       | `GET /hello` answering `{"message": "hello world"}`      |
//! | `submit_task` | `POST /tasks` on a task queue, expects `202`             |
//! | `list_tasks`  | `GET /tasks`, optionally filtered by status              |
//! | `async_task`  | `POST /api/tasks` on an async job API, expects `202`     |
//! | `shop`        | browse, fill a cart, view it and check out, in groups    |
//!
//! `default` is an alias for `hello`.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::json;

use crate::{
    iteration,
    metric::MetricKind,
    script::{IterationResult, Scripts},
    vu::Vu,
};

pub const TASKS_QUEUED: &str = "tasks_queued";
pub const SUBMIT_LATENCY: &str = "submit_latency";
pub const LIST_LATENCY: &str = "list_latency";
pub const TASKS_ACCEPTED: &str = "tasks_accepted";
pub const TASK_RESPONSE_TIME: &str = "task_response_time";
pub const CHECKOUTS_COMPLETED: &str = "checkouts_completed";

/// Registry with every built-in function and the custom metrics they write.
pub fn builtin() -> Scripts {
    let mut scripts = Scripts::new();
    scripts
        .register("default", hello)
        .register("hello", hello)
        .register("submit_task", submit_task)
        .register("list_tasks", list_tasks)
        .register("async_task", async_task)
        .register("shop", shop)
        .declare_metric(TASKS_QUEUED, MetricKind::Counter)
        .declare_metric(SUBMIT_LATENCY, MetricKind::Trend)
        .declare_metric(LIST_LATENCY, MetricKind::Trend)
        .declare_metric(TASKS_ACCEPTED, MetricKind::Counter)
        .declare_metric(TASK_RESPONSE_TIME, MetricKind::Trend)
        .declare_metric(CHECKOUTS_COMPLETED, MetricKind::Counter);
    scripts
}

#[derive(Deserialize)]
struct Hello {
    message: String,
}

#[iteration]
pub async fn hello(vu: &mut Vu) -> IterationResult {
    let res = vu.get("/hello").await;
    vu.check("status 200", res.status() == Some(200));
    let has_message = res
        .json::<Hello>()
        .is_ok_and(|body| body.message == "hello world");
    vu.check("has message", has_message);
    Ok(())
}

const TASK_PAYLOADS: [&str; 8] = [
    r#"{"action":"uppercase","data":{"text":"hello world"}}"#,
    r#"{"action":"uppercase","data":{"text":"load test message"}}"#,
    r#"{"action":"uppercase","data":{"text":"stress the queue"}}"#,
    r#"{"action":"sum","data":{"numbers":[1,2,3,4,5]}}"#,
    r#"{"action":"sum","data":{"numbers":[10,20,30,40,50]}}"#,
    r#"{"action":"cleanup","data":{"target":"/tmp"}}"#,
    r#"{"action":"report","data":{}}"#,
    r#"{"action":"index","data":{"collection":"users"}}"#,
];

#[iteration]
pub async fn submit_task(vu: &mut Vu) -> IterationResult {
    let payload = *vu.pick(&TASK_PAYLOADS).unwrap_or(&TASK_PAYLOADS[0]);
    let res = vu.post_json("/tasks", payload).await;
    vu.record(SUBMIT_LATENCY, res.duration_ms())?;

    if vu.check("queued (202)", res.status() == Some(202)) {
        vu.add(TASKS_QUEUED, 1.0)?;
    }
    Ok(())
}

#[iteration]
pub async fn list_tasks(vu: &mut Vu) -> IterationResult {
    let path = if vu.rng().gen_bool(0.5) {
        "/tasks?status=completed"
    } else {
        "/tasks"
    };
    let res = vu.get(path).await;
    vu.record(LIST_LATENCY, res.duration_ms())?;
    vu.check("list ok (200)", res.status() == Some(200));
    Ok(())
}

const TASK_NAMES: [&str; 8] = [
    "generate-report",
    "process-data",
    "send-notifications",
    "sync-inventory",
    "analyze-logs",
    "build-index",
    "compress-assets",
    "run-migration",
];

#[iteration]
pub async fn async_task(vu: &mut Vu) -> IterationResult {
    let name = *vu.pick(&TASK_NAMES).unwrap_or(&TASK_NAMES[0]);
    let duration: u32 = vu.rng().gen_range(1..=5);
    let body = serde_json::to_vec(&json!({ "name": name, "duration": duration }))?;

    let res = vu.post_json("/api/tasks", body).await;
    vu.record(TASK_RESPONSE_TIME, res.duration_ms())?;
    if vu.check("status is 202", res.status() == Some(202)) {
        vu.add(TASKS_ACCEPTED, 1.0)?;
    }

    vu.sleep(Duration::from_millis(100)).await;
    Ok(())
}

const SKUS: [&str; 5] = ["LAPTOP-001", "KB-002", "MOUSE-003", "MON-004", "HP-005"];

#[iteration]
pub async fn shop(vu: &mut Vu) -> IterationResult {
    let user = format!("user_{}_{}", vu.id(), vu.iteration());

    let group = vu.group("browse products");
    let res = vu.get("/api/products").await;
    vu.check("products listed", res.status() == Some(200));
    vu.sleep(Duration::from_millis(500)).await;
    vu.end_group(group);

    let group = vu.group("add items to cart");
    let items = vu.rng().gen_range(1..=3);
    for _ in 0..items {
        let sku = *vu.pick(&SKUS).unwrap_or(&SKUS[0]);
        let quantity: u32 = vu.rng().gen_range(1..=2);
        let body = serde_json::to_vec(&json!({ "sku": sku, "quantity": quantity }))?;
        let res = vu.post_json(&format!("/api/cart/{user}/items"), body).await;
        vu.check("item added", res.status() == Some(200));
        vu.sleep(Duration::from_millis(300)).await;
    }
    vu.end_group(group);

    let group = vu.group("view cart");
    let res = vu.get(&format!("/api/cart/{user}")).await;
    vu.check("cart retrieved", res.status() == Some(200));
    vu.sleep(Duration::from_millis(500)).await;
    vu.end_group(group);

    let group = vu.group("checkout");
    let url = vu.url(&format!("/api/cart/{user}/checkout"));
    let res = vu
        .request(crate::http::Request::post(url).header("Content-Type", "application/json"))
        .await;
    if vu.check("checkout ok", res.status() == Some(200)) {
        vu.add(CHECKOUTS_COMPLETED, 1.0)?;
    }
    vu.sleep(Duration::from_millis(500)).await;
    vu.end_group(group);

    // pause between shopping sessions
    vu.sleep(Duration::from_secs(1)).await;
    Ok(())
}
