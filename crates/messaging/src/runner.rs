//! Projection runner utilities (read model builders).
//!
//! Read models are **disposable**; events are the source of truth. This
//! module provides deterministic replay and per-aggregate cursor tracking
//! without making storage assumptions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use eventweave_core::AggregateId;

use crate::{EventEnvelope, Projection};

/// Per-aggregate replay progress for a projection, plus the catchup
/// "skip before" watermark.
///
/// Sequence numbers are only monotonic within a single aggregate's stream, so
/// the cursor tracks the last sequence number seen per [`AggregateId`] rather
/// than a single global counter. `skip_before` is set by a catchup strategy
/// that seeded the projection from a snapshot taken at some point in time;
/// events at or before that watermark are already reflected in the snapshot
/// and must be skipped rather than re-applied when they're redelivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionCursor {
    last_sequence_number: HashMap<AggregateId, u64>,
    skip_before: Option<DateTime<Utc>>,
}

impl ProjectionCursor {
    pub fn last_sequence_number(&self, aggregate_id: AggregateId) -> Option<u64> {
        self.last_sequence_number.get(&aggregate_id).copied()
    }

    /// The catchup skip-before watermark, if a catchup strategy has set one.
    pub fn skip_before(&self) -> Option<DateTime<Utc>> {
        self.skip_before
    }

    /// Sets (or replaces) the catchup skip-before watermark.
    pub fn set_skip_before(&mut self, watermark: DateTime<Utc>) {
        self.skip_before = Some(watermark);
    }

    /// Whether an event with this timestamp falls at or before the
    /// skip-before watermark and should be filtered out before dispatch.
    pub fn is_before_watermark(&self, occurred_at: DateTime<Utc>) -> bool {
        self.skip_before.is_some_and(|watermark| occurred_at <= watermark)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    #[error("non-monotonic sequence number for aggregate {aggregate_id}: last {last}, found {found}")]
    NonMonotonicSequence {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },
}

/// Runs envelopes through a projection and tracks per-aggregate progress.
#[derive(Debug)]
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    cursor: ProjectionCursor,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            cursor: ProjectionCursor::default(),
        }
    }

    /// Resumes a projection from a previously persisted cursor, e.g. after
    /// loading a checkpoint.
    pub fn resume(projection: P, cursor: ProjectionCursor) -> Self {
        Self { projection, cursor }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn projection_mut(&mut self) -> &mut P {
        &mut self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }

    /// Current cursor/version for this projection.
    pub fn cursor(&self) -> &ProjectionCursor {
        &self.cursor
    }

    /// Apply a single envelope, enforcing monotonic sequencing per aggregate.
    ///
    /// A duplicate or already-seen sequence number (`found <= last`) is
    /// treated as a no-op, not an error: at-least-once delivery means a
    /// projection must tolerate redelivery of an event it already applied.
    pub fn apply(&mut self, envelope: &EventEnvelope<P::Ev>) -> Result<(), ProjectionError> {
        let aggregate_id = envelope.aggregate_id();
        let found_seq = envelope.sequence_number();

        match self.cursor.last_sequence_number.get(&aggregate_id).copied() {
            None => {
                self.projection.apply(envelope);
                self.cursor.last_sequence_number.insert(aggregate_id, found_seq);
                Ok(())
            }
            Some(last) if found_seq <= last => Ok(()),
            Some(last) if found_seq == last + 1 => {
                self.projection.apply(envelope);
                self.cursor.last_sequence_number.insert(aggregate_id, found_seq);
                Ok(())
            }
            Some(last) => Err(ProjectionError::NonMonotonicSequence {
                aggregate_id,
                last,
                found: found_seq,
            }),
        }
    }

    /// Apply many envelopes in order.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<(), ProjectionError>
    where
        P::Ev: 'a,
    {
        for env in envelopes {
            self.apply(env)?;
        }
        Ok(())
    }

    /// Advances the cursor for `aggregate_id` to `sequence_number` without
    /// calling `Projection::apply`, used after a bulk catchup replay that
    /// applied events through its own path and only needs the cursor to
    /// reflect how far it got.
    pub fn record_external_progress(&mut self, aggregate_id: AggregateId, sequence_number: u64) {
        self.cursor.last_sequence_number.insert(aggregate_id, sequence_number);
    }

    /// Sets the catchup skip-before watermark on the cursor, after a catchup
    /// strategy has determined it.
    pub fn set_skip_before(&mut self, watermark: DateTime<Utc>) {
        self.cursor.set_skip_before(watermark);
    }

    /// Rebuild a projection from scratch by replaying the full event history.
    pub fn rebuild_from_scratch<'a>(
        factory: impl FnOnce() -> P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<(P, ProjectionCursor), ProjectionError>
    where
        P::Ev: 'a,
    {
        let mut runner = ProjectionRunner::new(factory());
        runner.run(envelopes)?;
        Ok((runner.projection, runner.cursor))
    }
}
