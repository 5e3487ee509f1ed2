//! Aggregate repository: load, rehydrate, decide, persist, publish.
//!
//! The dispatch pipeline is load -> validate monotonic sequence -> rehydrate
//! (cache, else snapshot + upcast + replay) -> decide -> persist -> publish,
//! with a per-aggregate-id mutex table serializing the whole
//! load-decide-append-publish scope so a single aggregate instance is never
//! handled by more than one command concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use eventweave_core::{Aggregate, AggregateId, ExpectedVersion};
use eventweave_messaging::{Event, EventEnvelope, ExecutionContext};
use eventweave_store::{
    AggregateCache, CachePolicy, CachedAggregate, EventStore, SnapshotBackend, SnapshotStrategy,
    StoredEvent, StoredSnapshot, UncommittedEvent, UpcastStrategy, UpcasterChain,
};

use crate::aggregate_handle::AggregateHandle;
use crate::error::RepositoryError;

/// Publishes committed events after a successful append. Kept as its own seam
/// (rather than requiring a concrete `EventBus` impl) so the repository and
/// the event delivery strategies in `crate::delivery` can be composed freely.
pub trait CommitPublisher: Send + Sync {
    fn publish(&self, events: &[StoredEvent]) -> Result<(), String>;
}

impl<F> CommitPublisher for F
where
    F: Fn(&[StoredEvent]) -> Result<(), String> + Send + Sync,
{
    fn publish(&self, events: &[StoredEvent]) -> Result<(), String> {
        self(events)
    }
}

/// Loads, rehydrates, and persists event-sourced aggregates.
pub struct AggregateRepository<S, P> {
    store: S,
    publisher: P,
    snapshots: Box<dyn SnapshotBackend>,
    cache: Box<dyn AggregateCache>,
    snapshot_strategy: SnapshotStrategy,
    cache_policy: CachePolicy,
    upcasters: Option<Arc<UpcasterChain>>,
    upcast_strategy: UpcastStrategy,
    locks: Mutex<HashMap<AggregateId, Arc<Mutex<()>>>>,
}

impl<S, P> AggregateRepository<S, P>
where
    S: EventStore,
    P: CommitPublisher,
{
    pub fn new(store: S, publisher: P) -> Self {
        Self {
            store,
            publisher,
            snapshots: Box::new(eventweave_store::NoOpSnapshotBackend),
            cache: Box::new(eventweave_store::NoOpAggregateCache),
            snapshot_strategy: SnapshotStrategy::Never,
            cache_policy: CachePolicy::NeverCache,
            upcasters: None,
            upcast_strategy: UpcastStrategy::Lazy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_snapshots(
        mut self,
        backend: Box<dyn SnapshotBackend>,
        strategy: SnapshotStrategy,
    ) -> Self {
        self.snapshots = backend;
        self.snapshot_strategy = strategy;
        self
    }

    pub fn with_cache(mut self, backend: Box<dyn AggregateCache>, policy: CachePolicy) -> Self {
        self.cache = backend;
        self.cache_policy = policy;
        self
    }

    /// Installs an upcaster chain so events loaded from history are migrated
    /// to their terminal type before being deserialized and replayed. With
    /// `UpcastStrategy::Eager`, a migrated event is also written back to the
    /// store via `EventStore::rewrite` the first time it's loaded.
    pub fn with_upcasters(mut self, chain: Arc<UpcasterChain>, strategy: UpcastStrategy) -> Self {
        self.upcasters = Some(chain);
        self.upcast_strategy = strategy;
        self
    }

    fn lock_for(&self, aggregate_id: AggregateId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("aggregate lock table poisoned");
        locks.entry(aggregate_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Dispatches a command against the named aggregate type, returning the
    /// newly committed events.
    ///
    /// `make_aggregate` constructs a fresh aggregate instance for replay from
    /// scratch; it is only invoked when neither the cache nor a snapshot has a
    /// usable prior state.
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: &A::Command,
        ctx: &ExecutionContext,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, RepositoryError>
    where
        A: Aggregate<Id = AggregateId> + Serialize + DeserializeOwned,
        A::Event: Event + Serialize + DeserializeOwned,
        A::Error: Into<RepositoryError>,
    {
        let aggregate_type = aggregate_type.into();
        let stream_lock = self.lock_for(aggregate_id);
        let _guard = stream_lock.lock().expect("aggregate stream lock poisoned");

        let history = self.store.load(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;
        let current_version = stream_version(&history);
        let expected = ExpectedVersion::Exact(current_version);

        let mut handle = self.rehydrate(aggregate_id, &history, current_version, make_aggregate)?;

        handle.handle_command(command).map_err(Into::into)?;
        let decided = handle.take_uncommitted();
        if decided.is_empty() {
            return Ok(vec![]);
        }

        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    aggregate_id,
                    aggregate_type.clone(),
                    Uuid::now_v7(),
                    Some(ctx.correlation_id()),
                    ctx.causation_id(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        self.publisher
            .publish(&committed)
            .map_err(RepositoryError::Publish)?;

        self.after_commit(aggregate_id, &handle, current_version + committed.len() as u64);

        Ok(committed)
    }

    fn rehydrate<A>(
        &self,
        aggregate_id: AggregateId,
        history: &[StoredEvent],
        current_version: u64,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<AggregateHandle<A>, RepositoryError>
    where
        A: Aggregate<Id = AggregateId> + Serialize + DeserializeOwned,
        A::Event: Event + Serialize + DeserializeOwned,
    {
        if let Some(cached) = self.cache.get(aggregate_id) {
            if cached.version <= current_version {
                let aggregate: A = serde_json::from_value(cached.state)
                    .map_err(|e| RepositoryError::Deserialize(e.to_string()))?;
                let mut handle = AggregateHandle::new(aggregate);
                self.apply_tail(&mut handle, aggregate_id, history, cached.version)?;
                return Ok(handle);
            }
            // Stale cache entry (rewound or replaced stream): fall through to a
            // full rebuild rather than trust pre-cached state.
        }

        if let Some(snapshot) = self.snapshots.load(aggregate_id) {
            if snapshot.version <= current_version {
                let aggregate: A = serde_json::from_value(snapshot.state)
                    .map_err(|e| RepositoryError::Deserialize(e.to_string()))?;
                let mut handle = AggregateHandle::new(aggregate);
                self.apply_tail(&mut handle, aggregate_id, history, snapshot.version)?;
                return Ok(handle);
            }
        }

        let mut handle = AggregateHandle::new(make_aggregate(aggregate_id));
        self.apply_tail(&mut handle, aggregate_id, history, 0)?;
        Ok(handle)
    }

    /// Replays history after `from_version`, running each stored event
    /// through the upcaster chain (if any) before deserializing it into the
    /// aggregate's event type.
    fn apply_tail<A>(
        &self,
        handle: &mut AggregateHandle<A>,
        aggregate_id: AggregateId,
        history: &[StoredEvent],
        from_version: u64,
    ) -> Result<(), RepositoryError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        for stored in history.iter().filter(|e| e.sequence_number > from_version) {
            let (_event_type, payload) = match &self.upcasters {
                Some(chain) => chain.upcast_stored(
                    &self.store,
                    self.upcast_strategy,
                    aggregate_id,
                    stored.event_id,
                    &stored.event_type,
                    stored.payload.clone(),
                ),
                None => (stored.event_type.clone(), stored.payload.clone()),
            };
            let event: A::Event = serde_json::from_value(payload)
                .map_err(|e| RepositoryError::Deserialize(e.to_string()))?;
            handle.replay(&event);
        }
        Ok(())
    }

    fn after_commit<A>(&self, aggregate_id: AggregateId, handle: &AggregateHandle<A>, new_version: u64)
    where
        A: Aggregate<Id = AggregateId> + Serialize,
    {
        let should_cache = matches!(self.cache_policy, CachePolicy::AlwaysCache);
        let should_snapshot = match self.snapshot_strategy {
            SnapshotStrategy::Never => false,
            SnapshotStrategy::AfterNEvents(n) => new_version % n.max(1) == 0,
            SnapshotStrategy::AfterTime(_) => false,
        };

        if !should_cache && !should_snapshot {
            return;
        }

        let Ok(state) = serde_json::to_value(handle.aggregate()) else {
            return;
        };

        if should_cache {
            self.cache.put(
                aggregate_id,
                CachedAggregate {
                    version: new_version,
                    state: state.clone(),
                },
            );
        }
        if should_snapshot {
            self.snapshots.store(
                aggregate_id,
                StoredSnapshot {
                    version: new_version,
                    state,
                },
            );
        }
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(aggregate_id: AggregateId, stream: &[StoredEvent]) -> Result<(), RepositoryError> {
    let mut last = 0u64;
    for e in stream {
        if e.aggregate_id != aggregate_id {
            return Err(RepositoryError::Store(eventweave_store::EventStoreError::InvalidAppend(
                "loaded stream contains events for the wrong aggregate".to_string(),
            )));
        }
        if e.sequence_number <= last {
            return Err(RepositoryError::Store(eventweave_store::EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

/// Converts a batch of stored events into JSON envelopes for publication.
pub fn to_envelopes(events: &[StoredEvent]) -> Vec<EventEnvelope<JsonValue>> {
    events.iter().map(StoredEvent::to_envelope).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventweave_core::{AggregateRoot, DomainError};
    use eventweave_messaging::Command as CommandTrait;
    use eventweave_store::{
        InMemoryAggregateCache, InMemoryEventStore, InMemorySnapshotBackend, NoOpAggregateCache,
        Upcaster,
    };
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone)]
    struct Deposit {
        id: AggregateId,
        amount: u64,
    }
    impl CommandTrait for Deposit {
        fn aggregate_id(&self) -> AggregateId {
            self.id
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    struct MoneyDeposited {
        amount: u64,
    }
    impl Event for MoneyDeposited {
        fn event_type(&self) -> &'static str {
            "money_deposited"
        }
        fn version(&self) -> u32 {
            1
        }
        fn occurred_at(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::Utc::now()
        }
    }

    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct Account {
        id: AggregateId,
        balance: u64,
        version: u64,
    }

    impl AggregateRoot for Account {
        type Id = AggregateId;
        fn id(&self) -> &Self::Id {
            &self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
    }

    impl Aggregate for Account {
        type Command = Deposit;
        type Event = MoneyDeposited;
        type Error = DomainError;

        fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
            Ok(vec![MoneyDeposited { amount: command.amount }])
        }

        fn apply(&mut self, event: &Self::Event) {
            self.balance += event.amount;
            self.version += 1;
        }
    }

    fn repo() -> AggregateRepository<InMemoryEventStore, impl CommitPublisher> {
        AggregateRepository::new(InMemoryEventStore::new(), |_: &[StoredEvent]| Ok(()))
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new()
    }

    #[test]
    fn single_deposit_commits_one_event_at_sequence_one() {
        let repository = repo();
        let id = AggregateId::new();
        let committed = repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 100 }, &ctx(), |id| Account {
                id,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].sequence_number, 1);
        assert_eq!(committed[0].payload["amount"], 100);
    }

    #[test]
    fn second_dispatch_replays_prior_events_and_continues_sequence() {
        let repository = repo();
        let id = AggregateId::new();
        repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 100 }, &ctx(), |id| Account {
                id,
                ..Default::default()
            })
            .unwrap();
        let second = repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 50 }, &ctx(), |id| Account {
                id,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(second[0].sequence_number, 2);
    }

    #[test]
    fn snapshot_seeds_replay_and_skips_earlier_events() {
        let snapshots = InMemorySnapshotBackend::new();
        let id = AggregateId::new();

        let store = InMemoryEventStore::new();
        let repository = AggregateRepository::new(store, |_: &[StoredEvent]| Ok(()))
            .with_snapshots(Box::new(snapshots), SnapshotStrategy::AfterNEvents(1));

        repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 10 }, &ctx(), |id| Account {
                id,
                ..Default::default()
            })
            .unwrap();
        repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 20 }, &ctx(), |id| Account {
                id,
                ..Default::default()
            })
            .unwrap();

        // A third dispatch rehydrates from the snapshot taken after the
        // second deposit, not from a full replay of both prior events.
        let third = repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 5 }, &ctx(), |id| Account {
                id,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(third[0].sequence_number, 3);
    }

    #[test]
    fn cached_aggregate_is_reused_when_version_matches() {
        let cache = InMemoryAggregateCache::new();
        let id = AggregateId::new();

        let store = InMemoryEventStore::new();
        let repository = AggregateRepository::new(store, |_: &[StoredEvent]| Ok(()))
            .with_cache(Box::new(cache), CachePolicy::AlwaysCache);

        repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 10 }, &ctx(), |id| Account {
                id,
                ..Default::default()
            })
            .unwrap();

        // The second dispatch should rehydrate straight from the cache
        // rather than calling make_aggregate or replaying from scratch.
        let make_aggregate_called = StdMutex::new(false);
        let second = repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 5 }, &ctx(), |id| {
                *make_aggregate_called.lock().unwrap() = true;
                Account { id, ..Default::default() }
            })
            .unwrap();

        assert_eq!(second[0].sequence_number, 2);
        assert!(!*make_aggregate_called.lock().unwrap());
    }

    #[test]
    fn concurrent_dispatch_on_same_aggregate_is_serialized() {
        use std::sync::Arc;
        use std::thread;

        let repository = Arc::new(repo());
        let id = AggregateId::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repository = repository.clone();
                thread::spawn(move || {
                    repository
                        .dispatch::<Account>(id, "account", &Deposit { id, amount: 1 }, &ctx(), |id| {
                            Account { id, ..Default::default() }
                        })
                        .unwrap()
                })
            })
            .collect();

        let mut sequences: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .map(|e| e.sequence_number)
            .collect();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    struct AddCurrency {
        from: &'static str,
        to: &'static str,
    }
    impl Upcaster for AddCurrency {
        fn from_type(&self) -> &str {
            self.from
        }
        fn to_type(&self) -> &str {
            self.to
        }
        fn upcast(&self, mut payload: JsonValue) -> (String, JsonValue) {
            payload["currency"] = JsonValue::String("USD".to_string());
            (self.to.to_string(), payload)
        }
    }

    #[test]
    fn lazy_upcasting_migrates_historical_payload_on_replay() {
        let id = AggregateId::new();
        let store = InMemoryEventStore::new();

        // Seed the store directly with a "v1" payload lacking the `currency`
        // field that the current `MoneyDeposited` event type carries.
        store
            .append(
                vec![UncommittedEvent {
                    event_id: Uuid::now_v7(),
                    aggregate_id: id,
                    aggregate_type: "account".to_string(),
                    event_type: "money_deposited.v1".to_string(),
                    event_version: 1,
                    occurred_at: chrono::Utc::now(),
                    correlation_id: None,
                    causation_id: None,
                    payload: serde_json::json!({"amount": 100}),
                }],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        let chain = Arc::new(
            UpcasterChain::new(vec![Box::new(AddCurrency {
                from: "money_deposited.v1",
                to: "money_deposited",
            })])
            .unwrap(),
        );

        let repository = AggregateRepository::new(store, |_: &[StoredEvent]| Ok(()))
            .with_upcasters(chain, UpcastStrategy::Lazy);

        let committed = repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 5 }, &ctx(), |id| Account {
                id,
                ..Default::default()
            })
            .unwrap();

        // Replay succeeded (the v1 payload deserialized into `MoneyDeposited`
        // only because the upcaster filled in the shape the type expects),
        // and the new deposit continues the sequence after the migrated event.
        assert_eq!(committed[0].sequence_number, 2);
    }

    #[test]
    fn no_cache_means_every_dispatch_replays_from_store() {
        let repository = AggregateRepository::new(InMemoryEventStore::new(), |_: &[StoredEvent]| Ok(()))
            .with_cache(Box::new(NoOpAggregateCache), CachePolicy::NeverCache);
        let id = AggregateId::new();

        repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 1 }, &ctx(), |id| Account {
                id,
                ..Default::default()
            })
            .unwrap();
        let second = repository
            .dispatch::<Account>(id, "account", &Deposit { id, amount: 1 }, &ctx(), |id| Account {
                id,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(second[0].sequence_number, 2);
    }
}
