use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use slotline::config::EngineConfig;
use slotline::engine::{Engine, InMemoryStore, now_ms};
use slotline::model::{Ms, Slot, Span, TimeBound};
use slotline::notify::NotifyHub;
use slotline::pipeline::{Association, MemoryUpstream, Modification, Pipeline, ShiftTemplateDef};
use slotline::scheduler::{ModificationQueue, run_scheduler};

/// One input line.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request {
    /// Queue a modification.
    Modify {
        #[serde(flatten)]
        association: Association,
        start: Option<Ms>,
        end: Option<Ms>,
        created_at: Option<Ms>,
    },
    /// Register a shift template with the upstream reference data.
    ShiftTemplate(ShiftTemplateDef),
    /// Record an operation detection.
    Detection {
        machine: u32,
        start: Option<Ms>,
        end: Option<Ms>,
        operation_id: u64,
    },
    /// Write the day timeline over a period.
    Days { start: Ms, end: Ms },
}

fn span(start: Option<Ms>, end: Option<Ms>) -> Span {
    Span::with_bounds(TimeBound::from(start), TimeBound::from(end))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Timelines go to stdout, logs to stderr.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = EngineConfig::from_env()?;
    slotline::observability::init(config.metrics_port);

    let store = Arc::new(InMemoryStore::new());
    let upstream = Arc::new(MemoryUpstream::new());
    let engine = Arc::new(Engine::new(config, store.clone(), Arc::new(NotifyHub::new())));
    let pipeline = Arc::new(Pipeline::new(engine.clone(), upstream.clone()));
    let queue = Arc::new(ModificationQueue::new());

    info!("slotline starting");
    info!("  day cutoffs: {}", engine.config.day_template);
    info!("  utc offset: {} min", engine.config.utc_offset_ms / 60_000);
    info!("  cache: {} (capacity {})", if engine.cache().is_active() { "active" } else { "inactive" }, engine.config.cache_capacity);
    info!("  metrics: {}", engine.config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Requests come from the file given as argument, or stdin.
    let reader: Box<dyn BufRead> = match std::env::args().nth(1) {
        Some(path) => Box::new(std::io::BufReader::new(std::fs::File::open(path)?)),
        None => Box::new(std::io::stdin().lock()),
    };
    let mut queued = 0usize;
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("line {}: invalid request: {e}", n + 1);
                continue;
            }
        };
        match request {
            Request::Modify { association, start, end, created_at } => {
                let m = Modification::new(association, span(start, end), created_at.unwrap_or_else(now_ms))
                    .with_step_span(engine.config.step_span_ms);
                match queue.push(m).await {
                    Ok(()) => queued += 1,
                    Err(e) => tracing::error!("line {}: {e}", n + 1),
                }
            }
            Request::ShiftTemplate(def) => upstream.add_shift_template(def),
            Request::Detection { machine, start, end, operation_id } => {
                upstream.detect_operation(machine, span(start, end), operation_id)
            }
            Request::Days { start, end } => {
                let engine = engine.clone();
                let result = tokio::task::spawn_blocking(move || {
                    engine.process_day_template(Span::new(start, end))
                })
                .await?;
                if let Err(e) = result {
                    tracing::error!("line {}: {e}", n + 1);
                }
            }
        }
    }
    info!("{queued} modifications queued");

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(run_scheduler(pipeline, queue.clone(), cancel.clone()));

    // Run until the queue drains (or nothing moves any more), or a signal.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    // Modifications leave the queue while processed: count completions,
    // not depth.
    let poll = Duration::from_millis(engine.config.retry_interval_ms.max(10));
    let mut finished = Vec::new();
    let mut last_done = 0;
    let mut idle_ticks = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(poll) => {
                finished.extend(queue.take_finished());
                if finished.len() >= queued {
                    break;
                }
                idle_ticks = if finished.len() == last_done { idle_ticks + 1 } else { 0 };
                last_done = finished.len();
                if idle_ticks >= 10 {
                    tracing::warn!("{} modifications still pending, giving up", queued - finished.len());
                    break;
                }
            }
        }
    }
    cancel.cancel();
    scheduler.await?;
    finished.extend(queue.take_finished());

    for m in &finished {
        info!("modification {} {:?} after {} attempts", m.id, m.status, m.attempts);
    }
    let timelines: BTreeMap<String, Vec<Slot>> = store
        .keys()
        .into_iter()
        .map(|key| (key.to_string(), store.timeline(&key)))
        .collect();
    println!("{}", serde_json::to_string_pretty(&timelines)?);

    info!("slotline stopped");
    Ok(())
}
