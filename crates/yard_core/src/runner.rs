//! Simulation runner: advances the clock and routes events into the ECS.
//!
//! Clock progression and event routing happen here, outside systems. Each
//! step pops the next event from [SimulationClock], inserts it as
//! [CurrentEvent], then runs the schedule. When the queue drains with
//! wagons still mid-pipeline, the run ends in a reported deadlock instead
//! of a silent truncation.

use bevy_ecs::prelude::{Res, Schedule, World};
use bevy_ecs::schedule::{apply_deferred, IntoSystemConfigs};
use tracing::warn;

use crate::clock::{CurrentEvent, EventKind, SimulationClock};
use crate::ecs::{RetrofitBatch, Wagon};
use crate::error::SimulationError;
use crate::scenario::{RetrofitQueue, SimulationEndTick};
use crate::shunting::LocomotivePool;
use crate::systems::{
    hump::hump_system,
    parking::return_check_system,
    pickup::pickup_system,
    train_arrival::train_arrival_system,
    transport::{
        coupling_done_system, decoupling_done_system, loco_arrived_at_origin_system,
        loco_dispatched_system, transport_arrived_system,
    },
    workshop::{retrofit_done_system, retrofit_start_system, station_request_system},
};
use crate::workshops::WorkshopRegistry;

// Condition functions for each event kind
fn is_train_arrived(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::TrainArrived)
        .unwrap_or(false)
}

fn is_hump_next(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::HumpNext)
        .unwrap_or(false)
}

fn is_pickup_check(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::PickupCheck)
        .unwrap_or(false)
}

fn is_loco_dispatched(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::LocoDispatched)
        .unwrap_or(false)
}

fn is_loco_arrived_at_origin(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::LocoArrivedAtOrigin)
        .unwrap_or(false)
}

fn is_coupling_done(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::CouplingDone)
        .unwrap_or(false)
}

fn is_transport_arrived(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::TransportArrived)
        .unwrap_or(false)
}

fn is_decoupling_done(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::DecouplingDone)
        .unwrap_or(false)
}

fn is_station_request(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::StationRequest)
        .unwrap_or(false)
}

fn is_retrofit_start(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::RetrofitStart)
        .unwrap_or(false)
}

fn is_retrofit_done(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::RetrofitDone)
        .unwrap_or(false)
}

fn is_return_check(event: Option<Res<CurrentEvent>>) -> bool {
    event
        .map(|e| e.0.kind == EventKind::ReturnCheck)
        .unwrap_or(false)
}

/// Runs one simulation step: pops the next event, inserts it as
/// [CurrentEvent], then runs the schedule. Returns `false` when the clock is
/// empty or the next event lies at or past [SimulationEndTick] (when that
/// resource is present).
pub fn run_next_event(world: &mut World, schedule: &mut Schedule) -> bool {
    let stop_at = world.get_resource::<SimulationEndTick>().map(|e| e.0);
    let next_ts = world
        .get_resource::<SimulationClock>()
        .and_then(|c| c.next_event_time());
    if let (Some(end_tick), Some(ts)) = (stop_at, next_ts) {
        if ts >= end_tick {
            return false;
        }
    }

    let event = match world.resource_mut::<SimulationClock>().pop_next() {
        Some(e) => e,
        None => return false,
    };
    world.insert_resource(CurrentEvent(event));
    schedule.run(world);
    true
}

/// Runs steps until the event queue drains or `max_steps` is hit, then
/// verifies the yard came to rest: every wagon in a terminal state. A drained
/// queue with wagons still mid-pipeline is a deadlock, not a success.
pub fn run_until_empty(
    world: &mut World,
    schedule: &mut Schedule,
    max_steps: usize,
) -> Result<usize, SimulationError> {
    let mut steps = 0;
    while run_next_event(world, schedule) {
        steps += 1;
        if steps >= max_steps {
            if world.resource::<SimulationClock>().is_empty() {
                break;
            }
            return Err(SimulationError::StepLimitExceeded { max_steps });
        }
    }
    if world.resource::<SimulationClock>().is_empty() {
        check_at_rest(world)?;
    }
    Ok(steps)
}

fn check_at_rest(world: &mut World) -> Result<(), SimulationError> {
    let blocked_wagons = world
        .query::<&Wagon>()
        .iter(world)
        .filter(|w| !w.is_terminal())
        .count();
    if blocked_wagons == 0 {
        return Ok(());
    }

    let mut blocked_waiters = 0;
    if let Some(pool) = world.get_resource::<LocomotivePool>() {
        blocked_waiters += pool.waiting();
    }
    if let Some(workshops) = world.get_resource::<WorkshopRegistry>() {
        blocked_waiters += workshops.total_waiting();
    }
    if let Some(queue) = world.get_resource::<RetrofitQueue>() {
        blocked_waiters += queue.0.waiting_getters() + queue.0.waiting_putters();
    }
    blocked_waiters += world
        .query::<&RetrofitBatch>()
        .iter(world)
        .filter(|b| b.stalled)
        .count();

    warn!(blocked_wagons, blocked_waiters, "simulation deadlocked");
    Err(SimulationError::Deadlock {
        blocked_wagons,
        blocked_waiters,
    })
}

/// Builds the yard schedule: one system per event kind, gated by its
/// condition, plus [apply_deferred] so spawned entities (rakes, jobs,
/// batches) are applied before the next step.
pub fn yard_schedule() -> Schedule {
    let mut schedule = Schedule::default();
    schedule.add_systems((
        train_arrival_system.run_if(is_train_arrived),
        hump_system.run_if(is_hump_next),
        pickup_system.run_if(is_pickup_check),
        loco_dispatched_system.run_if(is_loco_dispatched),
        loco_arrived_at_origin_system.run_if(is_loco_arrived_at_origin),
        coupling_done_system.run_if(is_coupling_done),
        transport_arrived_system.run_if(is_transport_arrived),
        decoupling_done_system.run_if(is_decoupling_done),
        station_request_system.run_if(is_station_request),
        retrofit_start_system.run_if(is_retrofit_start),
        retrofit_done_system.run_if(is_retrofit_done),
        return_check_system.run_if(is_return_check),
        apply_deferred,
    ));
    schedule
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::WagonState;
    use crate::error::SimulationError;
    use crate::scenario::{build_scenario, example_scenario};

    #[test]
    fn step_limit_is_a_loud_error() {
        let mut world = World::new();
        build_scenario(&mut world, &example_scenario()).expect("build");
        let mut schedule = yard_schedule();

        let err = run_until_empty(&mut world, &mut schedule, 3).expect_err("limit");
        assert_eq!(err, SimulationError::StepLimitExceeded { max_steps: 3 });
    }

    #[test]
    fn end_tick_stops_before_later_events_run() {
        let mut scenario = example_scenario();
        scenario.end_tick = Some(5); // retrofits complete at tick 10
        let mut world = World::new();
        build_scenario(&mut world, &scenario).expect("build");
        let mut schedule = yard_schedule();

        let steps = run_until_empty(&mut world, &mut schedule, 10_000).expect("run");
        assert!(steps > 0);
        // Events at or past the horizon stay queued, wagons unfinished.
        assert!(!world.resource::<SimulationClock>().is_empty());
        let retrofitting = world
            .query::<&Wagon>()
            .iter(&world)
            .filter(|w| w.state == WagonState::Retrofitting)
            .count();
        assert_eq!(retrofitting, 4);
    }

    #[test]
    fn parking_starvation_surfaces_as_deadlock() {
        let mut scenario = example_scenario();
        scenario.tracks[3].length_m = 10.0; // parking too short for any wagon
        scenario.capacity_retry_limit = 4;
        let mut world = World::new();
        build_scenario(&mut world, &scenario).expect("build");
        let mut schedule = yard_schedule();

        let err = run_until_empty(&mut world, &mut schedule, 10_000).expect_err("deadlock");
        match err {
            SimulationError::Deadlock {
                blocked_wagons,
                blocked_waiters,
            } => {
                assert_eq!(blocked_wagons, 4);
                assert!(blocked_waiters >= 1, "stalled batch counted");
            }
            other => panic!("expected deadlock, got {other:?}"),
        }
    }
}
