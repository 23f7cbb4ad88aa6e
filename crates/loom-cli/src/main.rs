use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, bail};
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};

use loom_core::config::RqConfig;
use loom_core::observability::{LogFormat, init_tracing};
use loom_core::{
    CallbackRegistry, ErrorKind, Invocation, RetryPolicy, TaskArgs, TaskError, TaskQueueConfiguration,
    TaskResult, WorkerManager, task_fn,
};

/// hello タスク：最初の `failures` 回はわざと失敗する
fn hello(failures: u32) -> Arc<dyn loom_core::TaskFn> {
    let remaining = Arc::new(AtomicU32::new(failures));
    task_fn(move |args: TaskArgs| {
        let remaining = Arc::clone(&remaining);
        async move {
            let name = args
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("world")
                .to_string();

            let left = remaining.load(Ordering::Relaxed);
            if left > 0 {
                remaining.fetch_sub(1, Ordering::Relaxed);
                return Err(TaskError::new(
                    ErrorKind::Transient,
                    format!("intentional failure (left={left})"),
                ));
            }

            println!("Hello, {name}!");
            Ok(json!({ "greeted": name }))
        }
    })
}

fn load_config() -> anyhow::Result<TaskQueueConfiguration> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("read config {path}"))?;
            TaskQueueConfiguration::from_json_str(&raw).with_context(|| format!("parse config {path}"))
        }
        None => Ok(TaskQueueConfiguration::Rq(RqConfig::new("memory://default"))),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = std::env::var("LOOM_LOG_FORMAT")
        .ok()
        .and_then(|raw| raw.parse::<LogFormat>().ok())
        .unwrap_or_default();
    init_tracing(format);

    // (A) hook を名前で登録
    let callbacks = Arc::new(CallbackRegistry::new());
    callbacks.register_fn("log_success", |result, _| {
        tracing::info!(result = ?result, "hook: success");
    })?;
    callbacks.register_fn("log_failure", |_, error| {
        tracing::warn!(error = ?error.map(ToString::to_string), "hook: failure");
    })?;

    // (B) 設定から manager を組み立てる
    let config = load_config()?;
    let manager = WorkerManager::builder(config).with_callbacks(callbacks).build()?;
    tracing::info!(backend = %manager.backend_type(), "manager built");

    // (C) task 定義と worker 起動
    // schedule 用は失敗なし（失敗カウンタは task ごと）
    let greet = manager.define_task("greet", hello(0)).await?;
    let hello = manager.define_task("hello", hello(2)).await?;
    manager.worker_start(2).await?;

    // (D) retry 付きで投入（2 回失敗して 3 回目で成功する）
    let policy = RetryPolicy::new(3, Duration::from_millis(200))
        .with_jitter(0.1)
        .retry_on(ErrorKind::Transient);
    let job = manager
        .enqueue_task(
            &hello,
            Invocation::new()
                .kwarg("name", "loom")
                .retry(policy)
                .result_ttl(Duration::from_secs(60))
                .on_success("log_success")
                .on_failure("log_failure"),
        )
        .await?;

    // (E) interval schedule も少しだけ回す
    let schedule = manager
        .schedule_task_interval(
            &greet,
            Duration::from_millis(500),
            Invocation::new().kwarg("name", "schedule"),
        )
        .await?;

    // (F) 結果をポーリング
    let mut outcome = TaskResult::Pending;
    for _ in 0..50 {
        outcome = manager.get_task(&job).await?;
        if !outcome.is_pending() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    match &outcome {
        TaskResult::Ready(value) => println!("job {job} -> {value}"),
        TaskResult::Failed(err) => println!("job {job} failed: {err}"),
        TaskResult::Pending => bail!("job {job} did not finish in time"),
        TaskResult::NotFound => println!("job {job}: result not retained"),
    }

    sleep(Duration::from_millis(1200)).await;
    for info in manager.list_schedules().await? {
        println!("schedule {} {} runs={}", info.id, info.trigger, info.runs);
    }
    manager.remove_schedule(&schedule).await?;

    // (G) worker の状態を JSON で出して停止
    let status = manager.worker_monitor().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    manager.worker_stop().await?;
    Ok(())
}
