use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bevy_ecs::prelude::{Entity, Resource};

use crate::error::SyncError;

/// Every wake-up the model knows. One system reacts to each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TrainArrived,
    HumpNext,
    PickupCheck,
    LocoDispatched,
    LocoArrivedAtOrigin,
    CouplingDone,
    TransportArrived,
    DecouplingDone,
    StationRequest,
    RetrofitStart,
    RetrofitDone,
    ReturnCheck,
}

/// Typed subject of an event. Replaces untyped cross-context parameters:
/// a handler can only read the entity kind it was scheduled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSubject {
    Train(Entity),
    Wagon(Entity),
    Job(Entity),
    Batch(Entity),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub timestamp: u64,
    /// Insertion sequence. Ties on `timestamp` resolve FIFO, which keeps
    /// same-tick wake-ups deterministic across runs.
    pub seq: u64,
    pub kind: EventKind,
    pub subject: Option<EventSubject>,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by (timestamp, seq).
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A deferred continuation: what to schedule when a primitive grants a
/// suspended request. Scheduled at delay 0 unless the releaser owes a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup {
    pub kind: EventKind,
    pub subject: Option<EventSubject>,
}

/// Tick-to-wall-clock conversion, supplied at clock construction instead of
/// living in a global constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TickScale {
    pub ms_per_tick: u64,
}

impl Default for TickScale {
    fn default() -> Self {
        Self { ms_per_tick: 1000 }
    }
}

/// The event being dispatched by the current scheduler step.
#[derive(Debug, Clone, Copy, Resource)]
pub struct CurrentEvent(pub Event);

#[derive(Debug, Resource)]
pub struct SimulationClock {
    now: u64,
    next_seq: u64,
    events: BinaryHeap<Event>,
    tick_scale: TickScale,
}

impl Default for SimulationClock {
    fn default() -> Self {
        Self::new(TickScale::default())
    }
}

impl SimulationClock {
    pub fn new(tick_scale: TickScale) -> Self {
        Self {
            now: 0,
            next_seq: 0,
            events: BinaryHeap::new(),
            tick_scale,
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn tick_scale(&self) -> TickScale {
        self.tick_scale
    }

    /// Wall-clock milliseconds for a tick count, per the configured scale.
    pub fn wall_ms(&self, ticks: u64) -> u64 {
        ticks * self.tick_scale.ms_per_tick
    }

    /// Schedule at an absolute tick. Scheduling into the past is the
    /// negative-delay misuse case and fails loudly.
    pub fn schedule_at(
        &mut self,
        timestamp: u64,
        kind: EventKind,
        subject: Option<EventSubject>,
    ) -> Result<(), SyncError> {
        if timestamp < self.now {
            return Err(SyncError::InvalidDelay {
                now: self.now,
                requested: timestamp,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(Event {
            timestamp,
            seq,
            kind,
            subject,
        });
        Ok(())
    }

    /// Schedule after a delay from `now`. Unsigned delay; cannot fail.
    pub fn schedule_in(&mut self, delay: u64, kind: EventKind, subject: Option<EventSubject>) {
        let timestamp = self.now + delay;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(Event {
            timestamp,
            seq,
            kind,
            subject,
        });
    }

    /// Schedule the continuation a primitive handed back on release.
    pub fn schedule_wakeup(&mut self, delay: u64, wakeup: Wakeup) {
        self.schedule_in(delay, wakeup.kind, wakeup.subject);
    }

    pub fn pop_next(&mut self) -> Option<Event> {
        let event = self.events.pop()?;
        debug_assert!(event.timestamp >= self.now, "clock went backwards");
        self.now = event.timestamp;
        Some(event)
    }

    pub fn next_event_time(&self) -> Option<u64> {
        self.events.peek().map(|e| e.timestamp)
    }

    pub fn pending_event_count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
