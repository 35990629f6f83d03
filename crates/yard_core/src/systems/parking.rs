use bevy_ecs::prelude::{Commands, Entity, Query, Res, ResMut};
use tracing::{info, warn};

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock, Wakeup};
use crate::ecs::{CouplerType, InBatch, JobPhase, RakeKind, RetrofitBatch, TransportJob, Wagon};
use crate::events::{DomainEvent, EventSinkResource};
use crate::scenario::{RetryPolicy, SimRng, Strategies};
use crate::shunting::{form_rake, LocomotivePool};
use crate::tracks::{TrackKind, TrackRegistry};

/// Woken by a batch's completion signal: finds parking capacity for the
/// whole retrofitted batch and dispatches the return transport. Probes are
/// bounded; an exhausted batch stays on the workshop track and stalls.
pub fn return_check_system(
    mut commands: Commands,
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    strategies: Res<Strategies>,
    policy: Res<RetryPolicy>,
    mut tracks: ResMut<TrackRegistry>,
    mut rng: ResMut<SimRng>,
    mut pool: ResMut<LocomotivePool>,
    mut sink: ResMut<EventSinkResource>,
    mut batches: Query<&mut RetrofitBatch>,
    wagons: Query<&Wagon>,
) {
    if event.0.kind != EventKind::ReturnCheck {
        return;
    }
    let Some(EventSubject::Batch(batch_entity)) = event.0.subject else {
        return;
    };
    let Ok(mut batch) = batches.get_mut(batch_entity) else {
        return;
    };
    let now = clock.now();

    // The batch moves as one unit, so the whole length must fit.
    let batch_length: f64 = batch
        .wagons
        .iter()
        .filter_map(|&e| wagons.get(e).ok())
        .map(|w| w.length_m)
        .sum();
    let candidates = tracks.ids_of_kind(TrackKind::Parking);
    let Some(target) = tracks.select_track(
        &candidates,
        batch_length,
        strategies.parking,
        "return",
        &mut rng.0,
    ) else {
        batch.return_retries += 1;
        if batch.return_retries > policy.limit {
            // Out of options: the batch keeps blocking the workshop track
            // and the run ends in a reported deadlock.
            batch.stalled = true;
            warn!(
                wagons = batch.wagons.len(),
                retries = batch.return_retries,
                "parking capacity probe exhausted, batch stalled"
            );
        } else {
            clock.schedule_in(
                policy.interval_ticks,
                EventKind::ReturnCheck,
                Some(EventSubject::Batch(batch_entity)),
            );
        }
        return;
    };

    tracks
        .reserve(target, batch_length)
        .expect("selected track fits");
    let members: Vec<(Entity, CouplerType)> = batch
        .wagons
        .iter()
        .filter_map(|&e| wagons.get(e).ok().map(|w| (e, w.coupler)))
        .collect();
    let rake = form_rake(
        RakeKind::Parking,
        &members,
        members.len(),
        batch.workshop_track,
        target,
        now,
    )
    .expect("retrofitted wagons carry matching couplers");

    let wagon_count = members.len();
    let rake_entity = commands.spawn(rake).id();
    sink.record(
        now,
        DomainEvent::RakeFormed {
            rake: rake_entity,
            kind: RakeKind::Parking,
            wagons: wagon_count,
            origin: batch.workshop_track,
            target,
        },
    );

    let job_entity = commands.spawn_empty().id();
    let locomotive = pool.allocate(Wakeup {
        kind: EventKind::LocoDispatched,
        subject: Some(EventSubject::Job(job_entity)),
    });
    commands.entity(job_entity).insert(TransportJob {
        phase: JobPhase::AwaitingLocomotive,
        rake: rake_entity,
        locomotive,
    });
    if locomotive.is_some() {
        clock.schedule_in(0, EventKind::LocoDispatched, Some(EventSubject::Job(job_entity)));
    }

    for &entity in &batch.wagons {
        commands.entity(entity).remove::<InBatch>();
    }
    commands.entity(batch_entity).despawn();
    info!(wagons = wagon_count, ?target, "retrofitted batch heads to parking");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::prelude::{Schedule, World};

    use crate::clock::Event;
    use crate::ecs::{Rake, WagonState};
    use crate::sync::Signal;
    use crate::tracks::{SelectionStrategy, Track, TrackId};

    fn return_world(parking_m: f64) -> (World, Entity) {
        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        world.insert_resource(Strategies {
            collection: SelectionStrategy::FirstAvailable,
            workshop: SelectionStrategy::FirstAvailable,
            parking: SelectionStrategy::FirstAvailable,
        });
        world.insert_resource(RetryPolicy {
            limit: 1,
            interval_ticks: 1,
        });
        world.insert_resource(SimRng::new(Some(1)));
        world.insert_resource(EventSinkResource::in_memory());

        let mut tracks = TrackRegistry::default();
        tracks.insert(Track::new(TrackId(3), TrackKind::Workshop, 100.0, 1.0));
        tracks.insert(Track::new(TrackId(4), TrackKind::Parking, parking_m, 1.0));
        tracks.reserve(TrackId(3), 20.0).expect("batch on workshop track");
        world.insert_resource(tracks);

        let loco = world.spawn_empty().id();
        world.insert_resource(LocomotivePool::new(vec![loco]));

        let wagon = world
            .spawn(Wagon {
                state: WagonState::Retrofitted,
                length_m: 20.0,
                is_loaded: false,
                needs_retrofit: false,
                maintenance_due: false,
                coupler: CouplerType::Dac,
                current_track: Some(TrackId(3)),
                source_track: None,
                destination_track: None,
                retrofit_started_at: Some(0),
                retrofit_completed_at: Some(10),
            })
            .id();
        let batch = world
            .spawn(RetrofitBatch {
                workshop_track: TrackId(3),
                wagons: vec![wagon],
                remaining: 0,
                done: Signal::new(),
                return_retries: 0,
                stalled: false,
            })
            .id();
        world.entity_mut(wagon).insert(InBatch(batch));
        (world, batch)
    }

    fn check(world: &mut World, batch: Entity) {
        world.insert_resource(CurrentEvent(Event {
            timestamp: world.resource::<SimulationClock>().now(),
            seq: 0,
            kind: EventKind::ReturnCheck,
            subject: Some(EventSubject::Batch(batch)),
        }));
        let mut schedule = Schedule::default();
        schedule.add_systems(return_check_system);
        schedule.run(world);
    }

    #[test]
    fn completed_batch_dispatches_a_parking_rake() {
        let (mut world, batch) = return_world(100.0);
        check(&mut world, batch);

        let rake = world.query::<&Rake>().single(&world);
        assert_eq!(rake.kind, RakeKind::Parking);
        assert_eq!(rake.origin, TrackId(3));
        assert_eq!(rake.target, TrackId(4));

        // Parking reserved up front; batch bookkeeping gone.
        let tracks = world.resource::<TrackRegistry>();
        assert!((tracks.get(TrackId(4)).expect("parking").used_m() - 20.0).abs() < 1e-9);
        assert!(world.query::<&RetrofitBatch>().iter(&world).next().is_none());

        let next = world
            .resource_mut::<SimulationClock>()
            .pop_next()
            .expect("dispatch");
        assert_eq!(next.kind, EventKind::LocoDispatched);
    }

    #[test]
    fn exhausted_parking_probe_stalls_the_batch() {
        let (mut world, batch) = return_world(10.0); // nothing fits

        check(&mut world, batch);
        let retry = world
            .resource_mut::<SimulationClock>()
            .pop_next()
            .expect("bounded retry");
        assert_eq!(retry.kind, EventKind::ReturnCheck);
        world.insert_resource(CurrentEvent(retry));
        let mut schedule = Schedule::default();
        schedule.add_systems(return_check_system);
        schedule.run(&mut world);

        let stalled = world.query::<&RetrofitBatch>().single(&world);
        assert!(stalled.stalled);
        assert!(world.resource::<SimulationClock>().is_empty());
        assert!(world.query::<&Rake>().iter(&world).next().is_none());
    }
}
