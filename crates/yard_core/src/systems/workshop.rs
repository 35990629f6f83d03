//! Station admission and the retrofit itself. Admission to a workshop goes
//! through its FIFO `CapacityResource`; a grant is followed by the station
//! transfer, the retrofit and the release that admits the next wagon.

use bevy_ecs::prelude::{Query, Res, ResMut};
use tracing::{debug, info};

use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock, Wakeup};
use crate::ecs::{CouplerType, InBatch, RetrofitBatch, Wagon, WagonState};
use crate::events::{DomainEvent, EventSinkResource};
use crate::scenario::ProcessTimes;
use crate::sync::Acquire;
use crate::workshops::WorkshopRegistry;

/// A delivered wagon asks its workshop for a station. Granted requests move
/// on after the station transfer; queued ones wait inside the admission FIFO.
pub fn station_request_system(
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    times: Res<ProcessTimes>,
    mut workshops: ResMut<WorkshopRegistry>,
    wagons: Query<&Wagon>,
) {
    if event.0.kind != EventKind::StationRequest {
        return;
    }
    let Some(EventSubject::Wagon(wagon_entity)) = event.0.subject else {
        return;
    };
    let Ok(wagon) = wagons.get(wagon_entity) else {
        return;
    };
    let Some(track) = wagon.current_track else {
        return;
    };
    let Some(shop) = workshops.by_home_track_mut(track) else {
        return;
    };

    match shop.admission.request(Wakeup {
        kind: EventKind::RetrofitStart,
        subject: Some(EventSubject::Wagon(wagon_entity)),
    }) {
        Acquire::Granted => {
            clock.schedule_in(
                times.station_transfer,
                EventKind::RetrofitStart,
                Some(EventSubject::Wagon(wagon_entity)),
            );
        }
        Acquire::Queued => {
            debug!(?wagon_entity, workshop = ?shop.id, "wagon queued for a station");
        }
    }
}

/// The wagon occupies a concrete station and the retrofit begins.
pub fn retrofit_start_system(
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    times: Res<ProcessTimes>,
    mut workshops: ResMut<WorkshopRegistry>,
    mut sink: ResMut<EventSinkResource>,
    mut wagons: Query<&mut Wagon>,
) {
    if event.0.kind != EventKind::RetrofitStart {
        return;
    }
    let Some(EventSubject::Wagon(wagon_entity)) = event.0.subject else {
        return;
    };
    let Ok(mut wagon) = wagons.get_mut(wagon_entity) else {
        return;
    };
    let Some(track) = wagon.current_track else {
        return;
    };
    let Some(shop) = workshops.by_home_track_mut(track) else {
        return;
    };

    let now = clock.now();
    let station = shop
        .mark_busy(wagon_entity, now)
        .expect("admission grant implies an idle station");
    wagon.state = WagonState::Retrofitting;
    wagon.retrofit_started_at = Some(now);
    sink.record(
        now,
        DomainEvent::StationOccupied {
            workshop: shop.id,
            station,
            wagon: wagon_entity,
        },
    );
    clock.schedule_in(
        times.retrofit_duration,
        EventKind::RetrofitDone,
        Some(EventSubject::Wagon(wagon_entity)),
    );
}

/// The retrofit completes: the wagon leaves its station with a DAC head, the
/// freed station admits the longest-queued wagon, and the batch counter
/// fires the return signal when it hits zero.
pub fn retrofit_done_system(
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    times: Res<ProcessTimes>,
    mut workshops: ResMut<WorkshopRegistry>,
    mut sink: ResMut<EventSinkResource>,
    mut wagons: Query<&mut Wagon>,
    memberships: Query<&InBatch>,
    mut batches: Query<&mut RetrofitBatch>,
) {
    if event.0.kind != EventKind::RetrofitDone {
        return;
    }
    let Some(EventSubject::Wagon(wagon_entity)) = event.0.subject else {
        return;
    };
    let Ok(mut wagon) = wagons.get_mut(wagon_entity) else {
        return;
    };
    let Some(track) = wagon.current_track else {
        return;
    };
    let Some(shop) = workshops.by_home_track_mut(track) else {
        return;
    };
    let Some(station) = shop.station_of(wagon_entity) else {
        return;
    };

    let now = clock.now();
    let record = shop
        .mark_available(station, now)
        .expect("station was busy");
    debug_assert_eq!(record.wagon, wagon_entity);

    wagon.state = WagonState::Retrofitted;
    // The conversion replaces the screw head with a DAC coupler.
    wagon.coupler = CouplerType::Dac;
    wagon.needs_retrofit = false;
    wagon.retrofit_completed_at = Some(now);
    sink.record(
        now,
        DomainEvent::StationIdle {
            workshop: shop.id,
            station,
        },
    );
    sink.record(
        now,
        DomainEvent::WagonRetrofitted {
            wagon: wagon_entity,
            workshop: shop.id,
            station,
        },
    );

    // The freed station goes to the longest-queued wagon, which still owes
    // the station transfer before its retrofit starts.
    let woken = shop
        .admission
        .release()
        .expect("completed wagon held a station");
    if let Some(woken) = woken {
        clock.schedule_wakeup(times.station_transfer, woken);
    }

    if let Ok(&InBatch(batch_entity)) = memberships.get(wagon_entity) {
        if let Ok(mut batch) = batches.get_mut(batch_entity) {
            batch.remaining = batch.remaining.saturating_sub(1);
            if batch.remaining == 0 {
                info!(workshop = ?shop.id, wagons = batch.wagons.len(), "batch complete");
                for woken in batch.done.succeed().expect("batch signal fires once") {
                    clock.schedule_wakeup(0, woken);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::prelude::{Entity, Schedule, World};

    use crate::clock::Event;
    use crate::sync::Signal;
    use crate::tracks::TrackId;
    use crate::workshops::{Workshop, WorkshopId};

    fn workshop_world(stations: usize) -> World {
        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        world.insert_resource(ProcessTimes {
            retrofit_duration: 10,
            station_transfer: 1,
            ..ProcessTimes::default()
        });
        world.insert_resource(EventSinkResource::in_memory());

        let mut workshops = WorkshopRegistry::default();
        workshops.insert(Workshop::new(WorkshopId(1), TrackId(3), stations));
        world.insert_resource(workshops);
        world
    }

    fn delivered_wagon(world: &mut World) -> Entity {
        world
            .spawn(Wagon {
                state: WagonState::MovingToStation,
                length_m: 20.0,
                is_loaded: false,
                needs_retrofit: true,
                maintenance_due: false,
                coupler: CouplerType::Screw,
                current_track: Some(TrackId(3)),
                source_track: None,
                destination_track: None,
                retrofit_started_at: None,
                retrofit_completed_at: None,
            })
            .id()
    }

    fn dispatch(world: &mut World, kind: EventKind, wagon: Entity) {
        let event = Event {
            timestamp: world.resource::<SimulationClock>().now(),
            seq: 0,
            kind,
            subject: Some(EventSubject::Wagon(wagon)),
        };
        world.insert_resource(CurrentEvent(event));
        let mut schedule = Schedule::default();
        schedule.add_systems((
            station_request_system,
            retrofit_start_system,
            retrofit_done_system,
        ));
        schedule.run(world);
    }

    #[test]
    fn granted_request_walks_to_completion_and_converts_the_coupler() {
        let mut world = workshop_world(1);
        let wagon = delivered_wagon(&mut world);

        dispatch(&mut world, EventKind::StationRequest, wagon);
        let start = world
            .resource_mut::<SimulationClock>()
            .pop_next()
            .expect("retrofit start");
        assert_eq!(start.kind, EventKind::RetrofitStart);
        assert_eq!(start.timestamp, 1, "station transfer owed before start");

        dispatch(&mut world, EventKind::RetrofitStart, wagon);
        {
            let started = world.entity(wagon).get::<Wagon>().expect("wagon");
            assert_eq!(started.state, WagonState::Retrofitting);
            assert_eq!(started.retrofit_started_at, Some(1));
            let shops = world.resource::<WorkshopRegistry>();
            assert_eq!(shops.get(WorkshopId(1)).expect("shop").busy_stations(), 1);
        }

        let done = world
            .resource_mut::<SimulationClock>()
            .pop_next()
            .expect("retrofit done");
        assert_eq!(done.timestamp, 11);
        dispatch(&mut world, EventKind::RetrofitDone, wagon);

        let finished = world.entity(wagon).get::<Wagon>().expect("wagon");
        assert_eq!(finished.state, WagonState::Retrofitted);
        assert_eq!(finished.coupler, CouplerType::Dac);
        assert!(!finished.needs_retrofit);
        assert_eq!(finished.retrofit_completed_at, Some(11));

        let shops = world.resource::<WorkshopRegistry>();
        let shop = shops.get(WorkshopId(1)).expect("shop");
        assert_eq!(shop.busy_stations(), 0);
        assert_eq!(shop.history().len(), 1);
        assert_eq!(shop.history()[0].started_at, 1);
        assert_eq!(shop.history()[0].completed_at, 11);
    }

    #[test]
    fn queued_wagon_is_woken_when_a_station_frees() {
        let mut world = workshop_world(1);
        let first = delivered_wagon(&mut world);
        let second = delivered_wagon(&mut world);

        dispatch(&mut world, EventKind::StationRequest, first);
        world.resource_mut::<SimulationClock>().pop_next().expect("start");
        dispatch(&mut world, EventKind::RetrofitStart, first);
        dispatch(&mut world, EventKind::StationRequest, second);

        {
            let shops = world.resource::<WorkshopRegistry>();
            assert_eq!(shops.total_waiting(), 1, "second wagon queued");
        }

        // Completing the first admits the second, transfer delay included.
        world.resource_mut::<SimulationClock>().pop_next().expect("done");
        dispatch(&mut world, EventKind::RetrofitDone, first);

        let woken = world
            .resource_mut::<SimulationClock>()
            .pop_next()
            .expect("woken start");
        assert_eq!(woken.kind, EventKind::RetrofitStart);
        assert_eq!(woken.subject, Some(EventSubject::Wagon(second)));
        assert_eq!(world.resource::<WorkshopRegistry>().total_waiting(), 0);
    }

    #[test]
    fn last_completion_fires_the_batch_signal() {
        let mut world = workshop_world(2);
        let wagon = delivered_wagon(&mut world);

        let batch_entity = world.spawn_empty().id();
        let mut done = Signal::new();
        assert!(!done.wait(Wakeup {
            kind: EventKind::ReturnCheck,
            subject: Some(EventSubject::Batch(batch_entity)),
        }));
        world.entity_mut(batch_entity).insert(RetrofitBatch {
            workshop_track: TrackId(3),
            wagons: vec![wagon],
            remaining: 1,
            done,
            return_retries: 0,
            stalled: false,
        });
        world.entity_mut(wagon).insert(InBatch(batch_entity));

        dispatch(&mut world, EventKind::StationRequest, wagon);
        world.resource_mut::<SimulationClock>().pop_next().expect("start");
        dispatch(&mut world, EventKind::RetrofitStart, wagon);
        world.resource_mut::<SimulationClock>().pop_next().expect("done");
        dispatch(&mut world, EventKind::RetrofitDone, wagon);

        let kinds: Vec<(EventKind, Option<EventSubject>)> =
            std::iter::from_fn(|| world.resource_mut::<SimulationClock>().pop_next())
                .map(|e| (e.kind, e.subject))
                .collect();
        assert!(kinds.contains(&(
            EventKind::ReturnCheck,
            Some(EventSubject::Batch(batch_entity))
        )));
    }
}
