//! Typed domain events emitted by the core. The core makes no assumption
//! about storage or export: it writes to an injected [`EventSink`], and the
//! default in-memory [`EventLog`] is read post-hoc by the metrics consumer.

use std::any::Any;

use bevy_ecs::prelude::{Entity, Resource};
use serde::{Serialize, Serializer};

fn entity_index<S: Serializer>(entity: &Entity, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u32(entity.index())
}

use crate::classification::RejectionReason;
use crate::ecs::RakeKind;
use crate::tracks::TrackId;
use crate::workshops::WorkshopId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    TrainArrived {
        train: u32,
        wagons: usize,
        track: TrackId,
    },
    TrainDeparted {
        train: u32,
    },
    WagonClassified {
        #[serde(serialize_with = "entity_index")]
        wagon: Entity,
        track: TrackId,
    },
    WagonBypassed {
        #[serde(serialize_with = "entity_index")]
        wagon: Entity,
        maintenance: bool,
    },
    WagonRejected {
        #[serde(serialize_with = "entity_index")]
        wagon: Entity,
        reason: RejectionReason,
    },
    WagonMoved {
        #[serde(serialize_with = "entity_index")]
        wagon: Entity,
        from: Option<TrackId>,
        to: TrackId,
    },
    WagonRetrofitted {
        #[serde(serialize_with = "entity_index")]
        wagon: Entity,
        workshop: WorkshopId,
        station: usize,
    },
    RakeFormed {
        #[serde(serialize_with = "entity_index")]
        rake: Entity,
        kind: RakeKind,
        wagons: usize,
        origin: TrackId,
        target: TrackId,
    },
    RakeDissolved {
        #[serde(serialize_with = "entity_index")]
        rake: Entity,
    },
    LocomotiveAllocated {
        #[serde(serialize_with = "entity_index")]
        locomotive: Entity,
    },
    LocomotiveReleased {
        #[serde(serialize_with = "entity_index")]
        locomotive: Entity,
    },
    StationOccupied {
        workshop: WorkshopId,
        station: usize,
        #[serde(serialize_with = "entity_index")]
        wagon: Entity,
    },
    StationIdle {
        workshop: WorkshopId,
        station: usize,
    },
}

/// Where domain events go. Implementations must not mutate core state.
pub trait EventSink: Send + Sync {
    fn record(&mut self, tick: u64, event: DomainEvent);

    /// Downcast hook so consumers can read back a concrete sink post-hoc.
    fn as_any(&self) -> &dyn Any;
}

/// Default sink: an append-only in-memory log, pull-only for consumers.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Vec<(u64, DomainEvent)>,
}

impl EventLog {
    pub fn entries(&self) -> &[(u64, DomainEvent)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl EventSink for EventLog {
    fn record(&mut self, tick: u64, event: DomainEvent) {
        self.entries.push((tick, event));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Resource wrapper around the injected sink.
#[derive(Resource)]
pub struct EventSinkResource(pub Box<dyn EventSink>);

impl EventSinkResource {
    pub fn in_memory() -> Self {
        Self(Box::new(EventLog::default()))
    }

    pub fn record(&mut self, tick: u64, event: DomainEvent) {
        self.0.record(tick, event);
    }

    /// The in-memory log, if that is what was injected.
    pub fn log(&self) -> Option<&EventLog> {
        self.0.as_any().downcast_ref::<EventLog>()
    }
}
