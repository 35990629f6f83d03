//! Error taxonomy. Configuration errors are fatal before the run starts;
//! misuse errors (double release, over-reserve, incompatible couplers) are
//! the programming-error class and are never coerced; capacity exhaustion is
//! not an error at all and never appears here.

use thiserror::Error;

use crate::tracks::TrackId;
use crate::workshops::WorkshopId;

/// Misuse of the scheduler or a synchronization primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("cannot schedule at tick {requested}, clock is already at {now}")]
    InvalidDelay { now: u64, requested: u64 },
    #[error("release without a matching hold")]
    ReleaseWithoutHold,
    #[error("signal already fired; arm a fresh signal for the next round")]
    SignalAlreadyFired,
}

/// Misuse of track capacity bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TrackError {
    #[error("track {0:?} does not exist")]
    UnknownTrack(TrackId),
    #[error("reserving {requested_m}m on track {track:?} exceeds effective capacity ({spare_m}m spare)")]
    CapacityExceeded {
        track: TrackId,
        requested_m: f64,
        spare_m: f64,
    },
    #[error("releasing {requested_m}m from track {track:?} which only holds {used_m}m")]
    ReleaseUnderflow {
        track: TrackId,
        requested_m: f64,
        used_m: f64,
    },
}

/// Misuse of workshop station bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WorkshopError {
    #[error("workshop {0:?} does not exist")]
    UnknownWorkshop(WorkshopId),
    #[error("all stations of workshop {0:?} are busy; admission must be granted first")]
    NoIdleStation(WorkshopId),
    #[error("station {station} of workshop {workshop:?} is not busy")]
    StationNotBusy { workshop: WorkshopId, station: usize },
}

/// Misuse of the shunting coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShuntingError {
    #[error("couplers {0:?} and {1:?} cannot be coupled")]
    IncompatibleCouplers(crate::ecs::CouplerType, crate::ecs::CouplerType),
    #[error("rake would exceed the locomotive limit of {max_wagons} wagons")]
    RakeTooLong { max_wagons: usize },
    #[error("cannot form an empty rake")]
    EmptyRake,
}

/// Scenario validation failures: fatal, raised before the first event fires.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("scenario defines no trains")]
    NoTrains,
    #[error("scenario defines no tracks")]
    NoTracks,
    #[error("workshop {0} has zero stations")]
    ZeroStationWorkshop(u32),
    #[error("no route between tracks {from:?} and {to:?}")]
    MissingRoute { from: TrackId, to: TrackId },
    #[error("wagon {wagon} of train {train} has non-positive length {length_m}")]
    NonPositiveWagonLength {
        train: u32,
        wagon: u32,
        length_m: f64,
    },
    #[error("track {0:?} has fill factor {1} outside (0, 1]")]
    InvalidFillFactor(TrackId, f64),
    #[error("locomotive {0} has a zero wagon limit")]
    ZeroCapacityLocomotive(u32),
    #[error("scenario references unknown track {0:?}")]
    UnknownTrack(TrackId),
    #[error("train {train} ({total_m}m of wagons) does not fit arrival track {track:?} ({capacity_m}m effective)")]
    ArrivalTrackTooShort {
        train: u32,
        track: TrackId,
        total_m: f64,
        capacity_m: f64,
    },
    #[error("scenario defines no locomotives")]
    NoLocomotives,
}

/// Top-level runner outcome. Configuration and misuse errors surface through
/// their own types before or during a step; only run-ending conditions live
/// here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("event queue drained with {blocked_wagons} wagons still in flight and {blocked_waiters} suspended waiters")]
    Deadlock {
        blocked_wagons: usize,
        blocked_waiters: usize,
    },
    #[error("step limit of {max_steps} exceeded")]
    StepLimitExceeded { max_steps: usize },
}
