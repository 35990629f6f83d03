//! Locomotive pool and shunting rules: coupler compatibility, coupling and
//! decoupling timing, rake formation and dissolution.

use bevy_ecs::prelude::{Entity, Resource};
use serde::{Deserialize, Serialize};

use crate::clock::Wakeup;
use crate::ecs::{CouplerType, Rake, RakeKind};
use crate::error::{ShuntingError, SyncError};
use crate::sync::{Acquire, CapacityResource};
use crate::tracks::TrackId;

/// Symmetric, reflexive-on-compatibles relation: screw couples to screw,
/// DAC to DAC, hybrid to anything.
pub fn couplers_compatible(a: CouplerType, b: CouplerType) -> bool {
    match (a, b) {
        (CouplerType::Hybrid, _) | (_, CouplerType::Hybrid) => true,
        (CouplerType::Screw, CouplerType::Screw) => true,
        (CouplerType::Dac, CouplerType::Dac) => true,
        _ => false,
    }
}

/// Per-coupler coupling/decoupling ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouplerTimes {
    pub screw: u64,
    pub dac: u64,
    pub hybrid: u64,
}

impl CouplerTimes {
    pub fn for_coupler(&self, coupler: CouplerType) -> u64 {
        match coupler {
            CouplerType::Screw => self.screw,
            CouplerType::Dac => self.dac,
            CouplerType::Hybrid => self.hybrid,
        }
    }
}

/// `(wagon_count - 1) * per_wagon`, zero for a single wagon: couplings
/// happen between neighbours, not per wagon.
pub fn coupling_ticks(wagon_count: usize, per_wagon: u64) -> u64 {
    (wagon_count.saturating_sub(1) as u64) * per_wagon
}

/// Form a rake from wagon identities. Enforces the coupler compatibility
/// rule across neighbours and the locomotive's wagon limit before anything
/// is allowed to couple.
pub fn form_rake(
    kind: RakeKind,
    wagons: &[(Entity, CouplerType)],
    max_wagons: usize,
    origin: TrackId,
    target: TrackId,
    now: u64,
) -> Result<Rake, ShuntingError> {
    if wagons.is_empty() {
        return Err(ShuntingError::EmptyRake);
    }
    if wagons.len() > max_wagons {
        return Err(ShuntingError::RakeTooLong { max_wagons });
    }
    for pair in wagons.windows(2) {
        let (_, a) = pair[0];
        let (_, b) = pair[1];
        if !couplers_compatible(a, b) {
            return Err(ShuntingError::IncompatibleCouplers(a, b));
        }
    }
    Ok(Rake {
        kind,
        wagons: wagons.iter().map(|&(e, _)| e).collect(),
        origin,
        target,
        formed_at: now,
    })
}

/// Dissolve a rake, handing the wagon identities back to the caller. The
/// grouping never owned them.
pub fn dissolve_rake(rake: Rake) -> Vec<Entity> {
    rake.wagons
}

/// The locomotive pool: a `CapacityResource` sized to the fleet plus the
/// concrete idle locomotives, granted FIFO.
#[derive(Debug, Resource)]
pub struct LocomotivePool {
    units: CapacityResource<Wakeup>,
    idle: Vec<Entity>,
}

impl LocomotivePool {
    pub fn new(locomotives: Vec<Entity>) -> Self {
        Self {
            units: CapacityResource::new(locomotives.len()),
            idle: locomotives,
        }
    }

    pub fn available(&self) -> usize {
        self.idle.len()
    }

    pub fn waiting(&self) -> usize {
        self.units.waiting()
    }

    /// Claim a locomotive now, or park `waiter` until one is released.
    /// `None` means the caller is queued and owns nothing yet.
    pub fn allocate(&mut self, waiter: Wakeup) -> Option<Entity> {
        match self.units.request(waiter) {
            Acquire::Granted => Some(
                self.idle
                    .pop()
                    .unwrap_or_else(|| unreachable!("granted unit implies an idle locomotive")),
            ),
            Acquire::Queued => None,
        }
    }

    /// A queued caller claims the concrete locomotive its wake-up stands
    /// for. Must only be called after the wake-up fired.
    pub fn take_granted(&mut self) -> Option<Entity> {
        self.idle.pop()
    }

    /// Return a locomotive. If someone is waiting the unit passes straight
    /// on and their wake-up token comes back for scheduling; double release
    /// fails loudly.
    pub fn release(&mut self, locomotive: Entity) -> Result<Option<Wakeup>, SyncError> {
        self.idle.push(locomotive);
        match self.units.release() {
            Ok(next) => Ok(next),
            Err(err) => {
                self.idle.pop();
                Err(err)
            }
        }
    }
}
