//! Event processor executor: drives a [`Projection`] over a stream of
//! envelopes, tracks replay progress via a checkpoint, and exposes lag
//! metrics for catchup decisions.
//!
//! A polling consumption loop, a pluggable replay strategy for catching up a
//! cold projection, and plain numeric lag gauges.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use eventweave_messaging::{EventEnvelope, Projection, ProjectionCursor, ProjectionError, ProjectionRunner};

/// Persists and restores a processor's replay progress across restarts.
pub trait CheckpointBackend: Send + Sync {
    fn load(&self, processor_name: &str) -> Option<ProjectionCursor>;
    fn save(&self, processor_name: &str, cursor: ProjectionCursor);
}

/// In-memory checkpoint store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointBackend {
    checkpoints: Mutex<HashMap<String, ProjectionCursor>>,
}

impl InMemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointBackend for InMemoryCheckpointBackend {
    fn load(&self, processor_name: &str) -> Option<ProjectionCursor> {
        self.checkpoints
            .lock()
            .ok()
            .and_then(|guard| guard.get(processor_name).cloned())
    }

    fn save(&self, processor_name: &str, cursor: ProjectionCursor) {
        if let Ok(mut guard) = self.checkpoints.lock() {
            guard.insert(processor_name.to_string(), cursor);
        }
    }
}

/// A condition that decides when a processor should switch from
/// tailing-events-as-they-arrive to a bulk catchup replay.
pub enum CatchupCondition {
    /// Catchup never triggers automatically.
    Never,
    /// Triggers once the unprocessed backlog reaches `n` events.
    AfterNEvents(u64),
    /// Triggers once the oldest unprocessed event is at least this old.
    AfterNAge(Duration),
    /// Triggers if any nested condition triggers.
    AnyOf(Vec<CatchupCondition>),
    /// Triggers only if every nested condition triggers.
    AllOf(Vec<CatchupCondition>),
}

impl CatchupCondition {
    pub fn is_triggered(&self, unprocessed_events: u64, oldest_unprocessed_age: Option<Duration>) -> bool {
        match self {
            CatchupCondition::Never => false,
            CatchupCondition::AfterNEvents(n) => unprocessed_events >= *n,
            CatchupCondition::AfterNAge(age) => oldest_unprocessed_age.is_some_and(|a| a >= *age),
            CatchupCondition::AnyOf(conditions) => conditions
                .iter()
                .any(|c| c.is_triggered(unprocessed_events, oldest_unprocessed_age)),
            CatchupCondition::AllOf(conditions) => conditions
                .iter()
                .all(|c| c.is_triggered(unprocessed_events, oldest_unprocessed_age)),
        }
    }
}

/// How a processor catches up once [`CatchupCondition`] fires.
pub enum CatchupStrategy<P: Projection> {
    /// No special handling: events keep arriving one at a time through the
    /// normal tailing path.
    NoCatchup,
    /// Bulk-apply a batch of envelopes in one call, bypassing per-event
    /// bookkeeping overhead. Returns the `skip_before` timestamp the
    /// executor should use to filter out events already incorporated by
    /// whatever state the strategy seeded the projection from (e.g. a
    /// snapshot taken at that point in time).
    Replay(Box<dyn Fn(&mut P, &[EventEnvelope<P::Ev>]) -> DateTime<Utc> + Send + Sync>),
}

/// Lag gauges for a processor, read by whatever the embedding application
/// forwards metrics to.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    unprocessed_events: AtomicU64,
    average_event_age_ms: AtomicI64,
}

impl ProcessorMetrics {
    pub fn unprocessed_events(&self) -> u64 {
        self.unprocessed_events.load(Ordering::Relaxed)
    }

    pub fn average_event_age(&self) -> Duration {
        let ms = self.average_event_age_ms.load(Ordering::Relaxed).max(0);
        Duration::from_millis(ms as u64)
    }

    fn record(&self, unprocessed_events: u64, average_event_age: Duration) {
        self.unprocessed_events.store(unprocessed_events, Ordering::Relaxed);
        self.average_event_age_ms
            .store(average_event_age.as_millis() as i64, Ordering::Relaxed);
    }
}

/// Drives a single [`Projection`] over an event stream: applies events in
/// order, persists a checkpoint after every batch, and surfaces lag metrics
/// so the caller can decide whether to switch to catchup mode.
pub struct ProcessorExecutor<P: Projection> {
    name: String,
    runner: Mutex<ProjectionRunner<P>>,
    checkpoints: Arc<dyn CheckpointBackend>,
    catchup_condition: CatchupCondition,
    catchup_strategy: CatchupStrategy<P>,
    metrics: ProcessorMetrics,
}

impl<P: Projection> ProcessorExecutor<P> {
    pub fn new(name: impl Into<String>, projection: P, checkpoints: Arc<dyn CheckpointBackend>) -> Self {
        let name = name.into();
        let runner = match checkpoints.load(&name) {
            Some(cursor) => ProjectionRunner::resume(projection, cursor),
            None => ProjectionRunner::new(projection),
        };
        Self {
            name,
            runner: Mutex::new(runner),
            checkpoints,
            catchup_condition: CatchupCondition::Never,
            catchup_strategy: CatchupStrategy::NoCatchup,
            metrics: ProcessorMetrics::default(),
        }
    }

    pub fn with_catchup(mut self, condition: CatchupCondition, strategy: CatchupStrategy<P>) -> Self {
        self.catchup_condition = condition;
        self.catchup_strategy = strategy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }

    /// Reports the current backlog so the executor can update its lag
    /// metrics and decide whether catchup should trigger. Callers own the
    /// transport and so are the ones who know the backlog depth/age.
    pub fn observe_backlog(&self, unprocessed_events: u64, oldest_unprocessed_age: Option<Duration>) -> bool {
        self.metrics
            .record(unprocessed_events, oldest_unprocessed_age.unwrap_or_default());
        self.catchup_condition
            .is_triggered(unprocessed_events, oldest_unprocessed_age)
    }

    /// The current catchup skip-before watermark, if one has been set by a
    /// prior catchup.
    pub fn skip_before(&self) -> Option<DateTime<Utc>> {
        self.runner.lock().expect("processor runner lock poisoned").cursor().skip_before()
    }

    /// Applies one envelope and persists the checkpoint.
    ///
    /// An envelope whose timestamp falls at or before the catchup
    /// skip-before watermark is skipped rather than applied: it's already
    /// reflected in whatever state the last catchup seeded the projection
    /// from, and at-least-once delivery means it may still be redelivered.
    pub fn process_one(&self, envelope: &EventEnvelope<P::Ev>) -> Result<(), ProjectionError> {
        let mut runner = self.runner.lock().expect("processor runner lock poisoned");
        if runner.cursor().is_before_watermark(envelope.occurred_at()) {
            return Ok(());
        }
        runner.apply(envelope)?;
        self.checkpoints.save(&self.name, runner.cursor().clone());
        Ok(())
    }

    /// Applies a batch via the configured catchup strategy (or falls back to
    /// applying one at a time if none was configured), then persists the
    /// checkpoint once for the whole batch.
    ///
    /// A `CatchupStrategy::Replay` strategy returns the `skip_before`
    /// timestamp to set on the checkpoint, so that events already folded
    /// into the state the strategy seeded are filtered out of the normal
    /// tailing path by [`Self::process_one`] instead of being re-applied.
    pub fn run_catchup(&self, envelopes: &[EventEnvelope<P::Ev>]) -> Result<(), ProjectionError> {
        let mut runner = self.runner.lock().expect("processor runner lock poisoned");
        match &self.catchup_strategy {
            CatchupStrategy::NoCatchup => {
                for envelope in envelopes {
                    runner.apply(envelope)?;
                }
            }
            CatchupStrategy::Replay(replay) => {
                let skip_before = replay(runner.projection_mut(), envelopes);
                for envelope in envelopes {
                    let aggregate_id = envelope.aggregate_id();
                    let seq = envelope.sequence_number();
                    runner.record_external_progress(aggregate_id, seq);
                }
                runner.set_skip_before(skip_before);
            }
        }
        self.checkpoints.save(&self.name, runner.cursor().clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventweave_core::AggregateId;
    use eventweave_messaging::EventEnvelope;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Counted(u32);
    impl eventweave_messaging::Event for Counted {
        fn event_type(&self) -> &'static str {
            "counted"
        }
        fn version(&self) -> u32 {
            1
        }
        fn occurred_at(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::Utc::now()
        }
    }

    #[derive(Default)]
    struct Tally(u32);
    impl Projection for Tally {
        type Ev = Counted;
        fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>) {
            self.0 += envelope.payload().0;
        }
    }

    #[test]
    fn processes_events_and_persists_checkpoint() {
        let checkpoints = Arc::new(InMemoryCheckpointBackend::new());
        let executor = ProcessorExecutor::new("tally", Tally::default(), checkpoints.clone());

        let aggregate_id = AggregateId::new();
        let env = EventEnvelope::new(uuid::Uuid::now_v7(), aggregate_id, "tally", 1, "counted", Counted(3));
        executor.process_one(&env).unwrap();

        let cursor = checkpoints.load("tally").unwrap();
        assert_eq!(cursor.last_sequence_number(aggregate_id), Some(1));
    }

    #[test]
    fn resumes_from_checkpoint() {
        let checkpoints = Arc::new(InMemoryCheckpointBackend::new());
        let aggregate_id = AggregateId::new();
        {
            let executor = ProcessorExecutor::new("tally", Tally::default(), checkpoints.clone());
            let env1 = EventEnvelope::new(uuid::Uuid::now_v7(), aggregate_id, "tally", 1, "counted", Counted(3));
            executor.process_one(&env1).unwrap();
        }

        let executor = ProcessorExecutor::new("tally", Tally::default(), checkpoints.clone());
        let env2 = EventEnvelope::new(uuid::Uuid::now_v7(), aggregate_id, "tally", 2, "counted", Counted(4));
        executor.process_one(&env2).unwrap();
        assert_eq!(executor.runner.lock().unwrap().projection().0, 4);
    }

    #[test]
    fn catchup_condition_triggers_after_threshold() {
        let condition = CatchupCondition::AfterNEvents(10);
        assert!(!condition.is_triggered(5, None));
        assert!(condition.is_triggered(10, None));
    }

    #[test]
    fn catchup_replay_sets_skip_before_watermark_on_the_checkpoint() {
        let checkpoints = Arc::new(InMemoryCheckpointBackend::new());
        let aggregate_id = AggregateId::new();
        let watermark = chrono::Utc::now();

        let executor = ProcessorExecutor::new("tally", Tally::default(), checkpoints.clone())
            .with_catchup(
                CatchupCondition::Never,
                CatchupStrategy::Replay(Box::new(move |projection, envelopes| {
                    projection.0 += envelopes.iter().map(|e| e.payload().0).sum::<u32>();
                    watermark
                })),
            );

        let env = EventEnvelope::new(uuid::Uuid::now_v7(), aggregate_id, "tally", 1, "counted", Counted(5))
            .with_occurred_at(watermark - chrono::Duration::seconds(1));
        executor.run_catchup(std::slice::from_ref(&env)).unwrap();

        assert_eq!(executor.skip_before(), Some(watermark));
        let cursor = checkpoints.load("tally").unwrap();
        assert_eq!(cursor.skip_before(), Some(watermark));
    }

    #[test]
    fn process_one_skips_envelopes_at_or_before_the_watermark() {
        let checkpoints = Arc::new(InMemoryCheckpointBackend::new());
        let aggregate_id = AggregateId::new();
        let watermark = chrono::Utc::now();

        let executor = ProcessorExecutor::new("tally", Tally::default(), checkpoints.clone())
            .with_catchup(
                CatchupCondition::Never,
                CatchupStrategy::Replay(Box::new(move |projection, envelopes| {
                    projection.0 += envelopes.iter().map(|e| e.payload().0).sum::<u32>();
                    watermark
                })),
            );

        let seeded = EventEnvelope::new(uuid::Uuid::now_v7(), aggregate_id, "tally", 1, "counted", Counted(5))
            .with_occurred_at(watermark - chrono::Duration::seconds(1));
        executor.run_catchup(std::slice::from_ref(&seeded)).unwrap();
        assert_eq!(executor.runner.lock().unwrap().projection().0, 5);

        // Redelivered pre-watermark event: already folded into the replay above.
        let redelivered = EventEnvelope::new(uuid::Uuid::now_v7(), aggregate_id, "tally", 1, "counted", Counted(5))
            .with_occurred_at(watermark - chrono::Duration::seconds(1));
        executor.process_one(&redelivered).unwrap();
        assert_eq!(executor.runner.lock().unwrap().projection().0, 5);

        // A fresh event after the watermark is applied normally.
        let fresh = EventEnvelope::new(uuid::Uuid::now_v7(), aggregate_id, "tally", 2, "counted", Counted(3))
            .with_occurred_at(watermark + chrono::Duration::seconds(1));
        executor.process_one(&fresh).unwrap();
        assert_eq!(executor.runner.lock().unwrap().projection().0, 8);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use eventweave_core::AggregateId;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Counted(u32);
    impl eventweave_messaging::Event for Counted {
        fn event_type(&self) -> &'static str {
            "counted"
        }
        fn version(&self) -> u32 {
            1
        }
        fn occurred_at(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::Utc::now()
        }
    }

    #[derive(Default)]
    struct Tally(u32);
    impl Projection for Tally {
        type Ev = Counted;
        fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>) {
            self.0 += envelope.payload().0;
        }
    }

    proptest! {
        /// A processor's persisted checkpoint position is never smaller than
        /// what it was before processing the next event in sequence, no
        /// matter how the executor is torn down and rebuilt against the same
        /// checkpoint backend in between events.
        #[test]
        fn checkpoint_position_is_monotonic_across_restarts(count in 1u64..20) {
            let checkpoints = Arc::new(InMemoryCheckpointBackend::new());
            let aggregate_id = AggregateId::new();
            let mut last_seen = 0u64;

            for seq in 1..=count {
                let executor = ProcessorExecutor::new("tally", Tally::default(), checkpoints.clone());
                let env = EventEnvelope::new(uuid::Uuid::now_v7(), aggregate_id, "tally", seq, "counted", Counted(1));
                executor.process_one(&env).unwrap();

                let cursor = checkpoints.load("tally").unwrap();
                let position = cursor.last_sequence_number(aggregate_id).unwrap();
                prop_assert!(position >= last_seen);
                prop_assert_eq!(position, seq);
                last_seen = position;
            }
        }
    }
}
