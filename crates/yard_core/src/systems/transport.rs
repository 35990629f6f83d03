//! Transport job lifecycle, one system per phase transition. A job moves a
//! rake from its origin to its target track behind one locomotive and
//! releases the locomotive on completion.

use bevy_ecs::prelude::{Commands, Query, Res, ResMut};
use tracing::{debug, info};

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock, Wakeup};
use crate::ecs::{
    InBatch, JobPhase, Locomotive, LocomotiveStatus, Rake, RakeKind, RetrofitBatch, TransportJob,
    Wagon, WagonState,
};
use crate::events::{DomainEvent, EventSinkResource};
use crate::scenario::{ProcessTimes, RouteTable};
use crate::shunting::{coupling_ticks, LocomotivePool};
use crate::sync::Signal;
use crate::tracks::TrackRegistry;

/// Binds a granted locomotive to its job and sends it towards the rake's
/// origin track. Fires both for immediate grants and for pool wake-ups.
pub fn loco_dispatched_system(
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    routes: Res<RouteTable>,
    mut pool: ResMut<LocomotivePool>,
    mut sink: ResMut<EventSinkResource>,
    mut jobs: Query<&mut TransportJob>,
    rakes: Query<&Rake>,
    mut locos: Query<&mut Locomotive>,
) {
    if event.0.kind != EventKind::LocoDispatched {
        return;
    }
    let Some(EventSubject::Job(job_entity)) = event.0.subject else {
        return;
    };
    let Ok(mut job) = jobs.get_mut(job_entity) else {
        return;
    };
    if job.phase != JobPhase::AwaitingLocomotive {
        return;
    }

    let locomotive = match job.locomotive {
        Some(entity) => entity,
        // Woken from the pool queue: claim the granted unit now.
        None => {
            let Some(entity) = pool.take_granted() else {
                return;
            };
            job.locomotive = Some(entity);
            entity
        }
    };
    sink.record(clock.now(), DomainEvent::LocomotiveAllocated { locomotive });

    let Ok(rake) = rakes.get(job.rake) else {
        return;
    };
    let Ok(mut loco) = locos.get_mut(locomotive) else {
        return;
    };
    loco.status = LocomotiveStatus::Moving;
    let travel = routes
        .route_ticks(loco.current_track, rake.origin)
        .expect("validated route");
    job.phase = JobPhase::MovingToOrigin;
    clock.schedule_in(
        travel,
        EventKind::LocoArrivedAtOrigin,
        Some(EventSubject::Job(job_entity)),
    );
    debug!(?locomotive, origin = ?rake.origin, travel, "locomotive under way");
}

/// The locomotive reaches the rake's origin track and starts coupling.
/// Coupling time scales with the number of gaps, per the head coupler type.
pub fn loco_arrived_at_origin_system(
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    times: Res<ProcessTimes>,
    mut jobs: Query<&mut TransportJob>,
    rakes: Query<&Rake>,
    mut locos: Query<&mut Locomotive>,
    wagons: Query<&Wagon>,
) {
    if event.0.kind != EventKind::LocoArrivedAtOrigin {
        return;
    }
    let Some(EventSubject::Job(job_entity)) = event.0.subject else {
        return;
    };
    let Ok(mut job) = jobs.get_mut(job_entity) else {
        return;
    };
    if job.phase != JobPhase::MovingToOrigin {
        return;
    }
    let Ok(rake) = rakes.get(job.rake) else {
        return;
    };
    let Some(locomotive) = job.locomotive else {
        return;
    };
    let Ok(mut loco) = locos.get_mut(locomotive) else {
        return;
    };

    loco.current_track = rake.origin;
    loco.status = LocomotiveStatus::Coupling;
    job.phase = JobPhase::Coupling;
    let per_gap = rake
        .wagons
        .first()
        .and_then(|&w| wagons.get(w).ok())
        .map(|w| times.coupling.for_coupler(w.coupler))
        .unwrap_or(0);
    clock.schedule_in(
        coupling_ticks(rake.wagons.len(), per_gap),
        EventKind::CouplingDone,
        Some(EventSubject::Job(job_entity)),
    );
}

/// Coupling finished: the rake pulls out. Origin capacity frees here, not at
/// arrival, so a following batch can take the track while this one travels.
pub fn coupling_done_system(
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    routes: Res<RouteTable>,
    mut tracks: ResMut<TrackRegistry>,
    mut jobs: Query<&mut TransportJob>,
    rakes: Query<&Rake>,
    mut locos: Query<&mut Locomotive>,
    mut wagons: Query<&mut Wagon>,
) {
    if event.0.kind != EventKind::CouplingDone {
        return;
    }
    let Some(EventSubject::Job(job_entity)) = event.0.subject else {
        return;
    };
    let Ok(mut job) = jobs.get_mut(job_entity) else {
        return;
    };
    if job.phase != JobPhase::Coupling {
        return;
    }
    let Ok(rake) = rakes.get(job.rake) else {
        return;
    };

    let mut total_length = 0.0;
    for &entity in &rake.wagons {
        let Ok(mut wagon) = wagons.get_mut(entity) else {
            continue;
        };
        total_length += wagon.length_m;
        wagon.state = if rake.kind == RakeKind::Workshop {
            WagonState::MovingToStation
        } else {
            WagonState::Moving
        };
        wagon.source_track = Some(rake.origin);
        wagon.destination_track = Some(rake.target);
        wagon.current_track = None;
    }
    tracks
        .release(rake.origin, total_length)
        .expect("rake wagons were reserved on origin");

    if let Some(locomotive) = job.locomotive {
        if let Ok(mut loco) = locos.get_mut(locomotive) {
            loco.status = LocomotiveStatus::Moving;
        }
    }
    job.phase = JobPhase::MovingToTarget;
    let travel = routes
        .route_ticks(rake.origin, rake.target)
        .expect("validated route");
    clock.schedule_in(
        travel,
        EventKind::TransportArrived,
        Some(EventSubject::Job(job_entity)),
    );
}

/// The rake reaches its target track and decoupling starts.
pub fn transport_arrived_system(
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    times: Res<ProcessTimes>,
    mut jobs: Query<&mut TransportJob>,
    rakes: Query<&Rake>,
    mut locos: Query<&mut Locomotive>,
    wagons: Query<&Wagon>,
) {
    if event.0.kind != EventKind::TransportArrived {
        return;
    }
    let Some(EventSubject::Job(job_entity)) = event.0.subject else {
        return;
    };
    let Ok(mut job) = jobs.get_mut(job_entity) else {
        return;
    };
    if job.phase != JobPhase::MovingToTarget {
        return;
    }
    let Ok(rake) = rakes.get(job.rake) else {
        return;
    };
    if let Some(locomotive) = job.locomotive {
        if let Ok(mut loco) = locos.get_mut(locomotive) {
            loco.current_track = rake.target;
            loco.status = LocomotiveStatus::Decoupling;
        }
    }
    job.phase = JobPhase::Decoupling;
    let per_gap = rake
        .wagons
        .first()
        .and_then(|&w| wagons.get(w).ok())
        .map(|w| times.decoupling.for_coupler(w.coupler))
        .unwrap_or(0);
    clock.schedule_in(
        coupling_ticks(rake.wagons.len(), per_gap),
        EventKind::DecouplingDone,
        Some(EventSubject::Job(job_entity)),
    );
}

/// Decoupling finished: wagons land on the target track, the rake dissolves
/// and the locomotive returns to the pool. Workshop deliveries additionally
/// spawn a [`RetrofitBatch`] whose one-shot signal wakes the return check
/// once the last wagon completes, and request a station per wagon.
pub fn decoupling_done_system(
    mut commands: Commands,
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    mut pool: ResMut<LocomotivePool>,
    mut sink: ResMut<EventSinkResource>,
    mut jobs: Query<&mut TransportJob>,
    rakes: Query<&Rake>,
    mut locos: Query<&mut Locomotive>,
    mut wagons: Query<&mut Wagon>,
) {
    if event.0.kind != EventKind::DecouplingDone {
        return;
    }
    let Some(EventSubject::Job(job_entity)) = event.0.subject else {
        return;
    };
    let Ok(mut job) = jobs.get_mut(job_entity) else {
        return;
    };
    if job.phase != JobPhase::Decoupling {
        return;
    }
    let Ok(rake) = rakes.get(job.rake) else {
        return;
    };
    let now = clock.now();

    for &entity in &rake.wagons {
        let Ok(mut wagon) = wagons.get_mut(entity) else {
            continue;
        };
        wagon.current_track = Some(rake.target);
        wagon.source_track = None;
        wagon.destination_track = None;
        sink.record(
            now,
            DomainEvent::WagonMoved {
                wagon: entity,
                from: Some(rake.origin),
                to: rake.target,
            },
        );
    }

    match rake.kind {
        RakeKind::Workshop => {
            let batch_entity = commands.spawn_empty().id();
            let mut done = Signal::new();
            let already_fired = done.wait(Wakeup {
                kind: EventKind::ReturnCheck,
                subject: Some(EventSubject::Batch(batch_entity)),
            });
            debug_assert!(!already_fired);
            commands.entity(batch_entity).insert(RetrofitBatch {
                workshop_track: rake.target,
                wagons: rake.wagons.clone(),
                remaining: rake.wagons.len(),
                done,
                return_retries: 0,
                stalled: false,
            });
            for &entity in &rake.wagons {
                commands.entity(entity).insert(InBatch(batch_entity));
                clock.schedule_in(0, EventKind::StationRequest, Some(EventSubject::Wagon(entity)));
            }
            info!(wagons = rake.wagons.len(), track = ?rake.target, "batch delivered to workshop");
        }
        _ => {
            for &entity in &rake.wagons {
                if let Ok(mut wagon) = wagons.get_mut(entity) {
                    wagon.state = WagonState::Parking;
                }
            }
            info!(wagons = rake.wagons.len(), track = ?rake.target, "rake parked");
        }
    }

    sink.record(now, DomainEvent::RakeDissolved { rake: job.rake });
    commands.entity(job.rake).despawn();
    job.phase = JobPhase::Done;

    if let Some(locomotive) = job.locomotive {
        if let Ok(mut loco) = locos.get_mut(locomotive) {
            loco.status = LocomotiveStatus::Parking;
        }
        let woken = pool
            .release(locomotive)
            .expect("job held the locomotive");
        if let Some(woken) = woken {
            clock.schedule_wakeup(0, woken);
        }
        sink.record(now, DomainEvent::LocomotiveReleased { locomotive });
    }
    commands.entity(job_entity).despawn();
}
