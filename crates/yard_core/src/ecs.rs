use bevy_ecs::prelude::{Component, Entity};
use serde::{Deserialize, Serialize};

use crate::tracks::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CouplerType {
    Screw,
    Dac,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WagonState {
    Parking,
    /// Transient: set immediately before classification, exited within the
    /// same scheduling step.
    Selecting,
    Selected,
    Rejected,
    OnRetrofitTrack,
    MovingToStation,
    Retrofitting,
    Retrofitted,
    Moving,
}

#[derive(Debug, Clone, Copy, PartialEq, Component)]
pub struct Wagon {
    pub state: WagonState,
    pub length_m: f64,
    pub is_loaded: bool,
    pub needs_retrofit: bool,
    /// Flagged for the maintenance exit at classification; leaves the
    /// pipeline like a bypass but is counted separately.
    pub maintenance_due: bool,
    pub coupler: CouplerType,
    pub current_track: Option<TrackId>,
    /// Set while a transport job is moving the wagon.
    pub source_track: Option<TrackId>,
    pub destination_track: Option<TrackId>,
    pub retrofit_started_at: Option<u64>,
    pub retrofit_completed_at: Option<u64>,
}

impl Wagon {
    /// A wagon is out of the pipeline once it parks or is rejected.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, WagonState::Parking | WagonState::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocomotiveStatus {
    Parking,
    Moving,
    Coupling,
    Decoupling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Component)]
pub struct Locomotive {
    pub status: LocomotiveStatus,
    pub home_track: TrackId,
    pub current_track: TrackId,
    /// Most wagons this locomotive hauls in one rake.
    pub max_wagons: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RakeKind {
    Collection,
    Workshop,
    Retrofitted,
    Parking,
}

/// A temporary, non-owning grouping of wagons moved together. Dissolved
/// (despawned) after transport; the wagons stay owned by their track.
#[derive(Debug, Clone, PartialEq, Component)]
pub struct Rake {
    pub kind: RakeKind,
    pub wagons: Vec<Entity>,
    pub origin: TrackId,
    pub target: TrackId,
    pub formed_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    AwaitingLocomotive,
    MovingToOrigin,
    Coupling,
    MovingToTarget,
    Decoupling,
    Done,
}

/// One locomotive transport of one rake, origin to target. The locomotive is
/// released on every exit path when the job completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Component)]
pub struct TransportJob {
    pub phase: JobPhase,
    pub rake: Entity,
    pub locomotive: Option<Entity>,
}

/// A train that has arrived and is being humped wagon by wagon.
#[derive(Debug, Clone, Component)]
pub struct Train {
    pub scenario_id: u32,
    pub arrival_track: TrackId,
    /// Wagons still waiting for the hump, front first.
    pub to_hump: std::collections::VecDeque<Entity>,
}

/// Back-reference from a delivered wagon to its [`RetrofitBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Component)]
pub struct InBatch(pub Entity);

/// Tracks one delivered workshop batch until its last wagon completes, then
/// its one-shot signal wakes the return-to-parking check. A fresh batch gets
/// a fresh signal.
#[derive(Debug, Component)]
pub struct RetrofitBatch {
    pub workshop_track: TrackId,
    pub wagons: Vec<Entity>,
    pub remaining: usize,
    pub done: crate::sync::Signal<crate::clock::Wakeup>,
    pub return_retries: u32,
    pub stalled: bool,
}
