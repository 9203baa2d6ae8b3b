use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{EngineError, now_ms};
use crate::limits::MAX_QUEUED_PER_KEY;
use crate::model::{Entity, Ms};
use crate::observability::QUEUE_DEPTH;
use crate::pipeline::{Checked, Modification, Pipeline};

type EntityQueue = Arc<Mutex<VecDeque<Modification>>>;

/// Modifications waiting to be processed, one FIFO per entity.
///
/// Within an entity modifications are applied strictly in queue order: the
/// head blocks the ones behind it until it is terminal. Entities are
/// processed in parallel.
#[derive(Default)]
pub struct ModificationQueue {
    queues: DashMap<Entity, EntityQueue>,
    finished: parking_lot::Mutex<Vec<Modification>>,
}

impl ModificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, m: Modification) -> Result<(), EngineError> {
        let queue = self
            .queues
            .entry(m.association.entity())
            .or_default()
            .value()
            .clone();
        let mut guard = queue.lock().await;
        if guard.len() >= MAX_QUEUED_PER_KEY {
            return Err(EngineError::LimitExceeded("too many queued modifications"));
        }
        guard.push_back(m);
        Ok(())
    }

    pub async fn depth(&self) -> usize {
        let queues: Vec<EntityQueue> = self.queues.iter().map(|e| e.value().clone()).collect();
        let mut depth = 0;
        for q in queues {
            depth += q.lock().await.len();
        }
        depth
    }

    /// Terminal modifications, in completion order, removed from the queue.
    pub fn take_finished(&self) -> Vec<Modification> {
        std::mem::take(&mut *self.finished.lock())
    }

    async fn drain_entity(
        &self,
        queue: EntityQueue,
        pipeline: &Arc<Pipeline>,
        now: Ms,
        cancel: &CancellationToken,
    ) -> usize {
        let mut guard = queue.lock().await;
        let mut done = 0;
        while let Some(m) = guard.pop_front() {
            if cancel.is_cancelled() {
                guard.push_front(m);
                break;
            }
            let before = m.progress();
            let checked: Arc<dyn Checked> = Arc::new(cancel.clone());
            let m = pipeline.process_async(m, now, checked).await;
            if m.status.is_terminal() {
                info!("modification {} finished: {:?}", m.id, m.status);
                self.finished.lock().push(m);
                done += 1;
                continue;
            }
            let progressed = m.progress() != before;
            guard.push_front(m);
            if !progressed {
                break;
            }
        }
        done
    }

    /// Process every entity queue once. Returns how many modifications
    /// reached a terminal status.
    pub async fn run_once(
        &self,
        pipeline: &Arc<Pipeline>,
        now: Ms,
        cancel: &CancellationToken,
    ) -> usize {
        let queues: Vec<EntityQueue> = self.queues.iter().map(|e| e.value().clone()).collect();
        let done = futures::future::join_all(
            queues
                .into_iter()
                .map(|q| self.drain_entity(q, pipeline, now, cancel)),
        )
        .await
        .into_iter()
        .sum();
        metrics::gauge!(QUEUE_DEPTH).set(self.depth().await as f64);
        done
    }
}

/// Background task retrying queued modifications until cancelled.
pub async fn run_scheduler(
    pipeline: Arc<Pipeline>,
    queue: Arc<ModificationQueue>,
    cancel: CancellationToken,
) {
    let period = Duration::from_millis(pipeline.engine().config.retry_interval_ms.max(1));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let done = queue.run_once(&pipeline, now_ms(), &cancel).await;
        if done > 0 {
            tracing::debug!("scheduler tick: {done} modifications finished");
        }
    }
    info!("scheduler stopped");
}
