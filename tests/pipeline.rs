use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use slotline::config::EngineConfig;
use slotline::engine::{DAY_KEY, Engine, InMemoryStore};
use slotline::model::*;
use slotline::notify::NotifyHub;
use slotline::pipeline::{
    Association, MemoryUpstream, Modification, ModificationStatus, Pipeline, ShiftTemplateDef,
};
use slotline::scheduler::{ModificationQueue, run_scheduler};

const JAN1: Ms = 1_704_067_200_000; // 2024-01-01T00:00:00Z, a Monday
const H: Ms = 3_600_000;
const DAY: Ms = 24 * H;

fn jan(d: i64) -> Ms {
    JAN1 + (d - 1) * DAY
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

// ── Test infrastructure ──────────────────────────────────────

struct Plant {
    engine: Arc<Engine>,
    pipeline: Arc<Pipeline>,
    store: Arc<InMemoryStore>,
    upstream: Arc<MemoryUpstream>,
    notify: Arc<NotifyHub>,
    queue: Arc<ModificationQueue>,
}

fn plant() -> Plant {
    let store = Arc::new(InMemoryStore::new());
    let upstream = Arc::new(MemoryUpstream::new());
    let notify = Arc::new(NotifyHub::new());
    let config = EngineConfig {
        day_template: "06:00@all".parse().unwrap(),
        cache_active: true,
        step_span_ms: Some(DAY),
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::new(config, store.clone(), notify.clone()));
    let pipeline = Arc::new(Pipeline::new(engine.clone(), upstream.clone()));
    Plant {
        engine,
        pipeline,
        store,
        upstream,
        notify,
        queue: Arc::new(ModificationQueue::new()),
    }
}

impl Plant {
    async fn submit(&self, association: Association, period: Span, now: Ms) {
        let m = Modification::new(association, period, now)
            .with_step_span(self.engine.config.step_span_ms);
        self.queue.push(m).await.unwrap();
    }
}

fn machine_state(machine: u32, template_id: u32) -> Association {
    Association::Fact {
        key: SlotKey::new(Entity::Machine(machine), SlotKind::MachineState),
        payload: Payload::MachineState {
            template_id: Some(template_id),
        },
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn shift_template_and_state_on_one_machine() {
    let plant = plant();
    let now = jan(10);
    plant.upstream.add_shift_template(ShiftTemplateDef {
        id: 7,
        shifts: [Some(1), Some(1), Some(2), Some(2), Some(2), None, None],
    });
    let mut shifts = plant.notify.subscribe(SlotKind::Shift);
    let mut states = plant.notify.subscribe(SlotKind::MachineState);

    let entity = Entity::Machine(1);
    plant
        .submit(
            Association::ShiftTemplate { entity, template_id: 7 },
            Span::new(jan(1) + 6 * H, jan(4) + 6 * H),
            now,
        )
        .await;
    plant
        .submit(machine_state(1, 3), Span::new(jan(1), jan(3)), now)
        .await;

    let done = plant
        .queue
        .run_once(&plant.pipeline, now, &CancellationToken::new())
        .await;
    assert_eq!(done, 2);
    assert_eq!(plant.queue.depth().await, 0);

    let finished = plant.queue.take_finished();
    assert!(finished.iter().all(|m| m.status == ModificationStatus::Completed));
    // Template slot, then one shift chunk per day.
    assert_eq!(finished[0].attempts, 4);

    let template = plant.store.timeline(&SlotKey::new(entity, SlotKind::ShiftTemplate));
    assert_eq!(template.len(), 1);
    assert_eq!(template[0].payload, Payload::ShiftTemplate { template_id: 7 });

    let shifts_written: Vec<(Span, Option<u32>, Option<NaiveDate>)> = plant
        .store
        .timeline(&SlotKey::new(entity, SlotKind::Shift))
        .into_iter()
        .map(|s| match s.payload {
            Payload::Shift { shift_id, day } => (*s.interval.span(), shift_id, day),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    assert_eq!(
        shifts_written,
        vec![
            (Span::new(jan(1) + 6 * H, jan(2) + 6 * H), Some(1), Some(date("2024-01-01"))),
            (Span::new(jan(2) + 6 * H, jan(3) + 6 * H), Some(1), Some(date("2024-01-02"))),
            (Span::new(jan(3) + 6 * H, jan(4) + 6 * H), Some(2), Some(date("2024-01-03"))),
        ]
    );

    assert_eq!(shifts.try_recv().unwrap(), "shift/machine-1");
    assert_eq!(states.try_recv().unwrap(), "machine-state/machine-1");
    assert!(matches!(states.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn detection_catches_up_later() {
    let plant = plant();
    let now = jan(10);
    let mut operations = plant.notify.subscribe(SlotKind::Operation);

    plant
        .submit(
            Association::DetectedOperation { machine: 4 },
            Span::new(jan(2), jan(2) + 8 * H),
            now,
        )
        .await;
    plant
        .submit(machine_state(5, 1), Span::new(jan(2), jan(3)), now)
        .await;

    let cancel = CancellationToken::new();
    assert_eq!(plant.queue.run_once(&plant.pipeline, now, &cancel).await, 1);
    assert_eq!(plant.queue.depth().await, 1);
    assert!(matches!(operations.try_recv(), Err(TryRecvError::Empty)));

    plant.upstream.detect_operation(4, Span::new(jan(1), jan(3)), 42);
    assert_eq!(plant.queue.run_once(&plant.pipeline, now, &cancel).await, 1);
    assert_eq!(operations.try_recv().unwrap(), "operation/machine-4");

    let timeline = plant
        .store
        .timeline(&SlotKey::new(Entity::Machine(4), SlotKind::Operation));
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].span(), &Span::new(jan(2), jan(2) + 8 * H));
    assert_eq!(
        timeline[0].payload,
        Payload::Operation {
            operation_id: Some(42),
            auto: true
        }
    );
}

#[tokio::test]
async fn stale_and_broken_modifications_are_terminal() {
    let plant = plant();
    let now = jan(30);
    let stale = Modification::new(machine_state(1, 1), Span::new(jan(1), jan(2)), jan(1));
    plant.queue.push(stale).await.unwrap();
    plant
        .submit(machine_state(2, 1), Span::new(jan(3), jan(2)), now)
        .await;

    plant
        .queue
        .run_once(&plant.pipeline, now, &CancellationToken::new())
        .await;
    let mut statuses: Vec<ModificationStatus> =
        plant.queue.take_finished().iter().map(|m| m.status).collect();
    statuses.sort_by_key(|s| format!("{s:?}"));
    assert_eq!(statuses, vec![ModificationStatus::Error, ModificationStatus::Obsolete]);
    assert_eq!(plant.store.slot_count(), 0);
}

#[tokio::test]
async fn scheduler_drains_queue_in_background() {
    let plant = plant();
    let now = slotline::engine::now_ms();
    for machine in 1..=5 {
        plant
            .submit(machine_state(machine, machine), Span::new(now - 3 * DAY, now - DAY), now)
            .await;
    }

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_scheduler(
        plant.pipeline.clone(),
        plant.queue.clone(),
        cancel.clone(),
    ));
    // The queue can read empty while its last head is in flight: wait for
    // completions instead.
    let mut finished = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while finished.len() < 5 {
            finished.extend(plant.queue.take_finished());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(plant.queue.depth().await, 0);
    assert!(finished.iter().all(|m| m.status == ModificationStatus::Completed));
    // Two daily chunks per machine, coalesced into a single slot.
    assert_eq!(plant.store.slot_count(), 5);
}

#[tokio::test]
async fn day_timeline_served_from_cache() {
    let plant = plant();
    let engine = plant.engine.clone();
    let written = tokio::task::spawn_blocking(move || {
        engine.process_day_template(Span::new(jan(1) + 6 * H, jan(8) + 6 * H))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(written, 7);
    assert_eq!(plant.store.timeline(&DAY_KEY).len(), 7);

    // 05:00 still belongs to the previous logical day.
    let slot = plant.engine.find_day_at(jan(4) + 5 * H).unwrap();
    assert_eq!(slot.day(), Some(date("2024-01-03")));
    assert_eq!(
        plant.engine.cache().try_get_by_day(date("2024-01-03")).map(|s| s.id),
        Some(slot.id)
    );
}
