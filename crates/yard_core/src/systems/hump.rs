use bevy_ecs::prelude::{Query, Res, ResMut};
use tracing::{debug, info};

use crate::classification::{ClassificationDecision, HumpYard, RejectionStats};
use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::ecs::{Train, Wagon, WagonState};
use crate::events::{DomainEvent, EventSinkResource};
use crate::scenario::{ProcessTimes, RetrofitQueue, SimRng, Strategies};
use crate::tracks::{TrackKind, TrackRegistry};

/// Humps the next wagon of a train: classifies it, routes it to a collection
/// track (feeding the retrofit queue), to parking, or out of the yard, then
/// schedules the next hump step.
pub fn hump_system(
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    times: Res<ProcessTimes>,
    yard: Res<HumpYard>,
    strategies: Res<Strategies>,
    mut tracks: ResMut<TrackRegistry>,
    mut queue: ResMut<RetrofitQueue>,
    mut rng: ResMut<SimRng>,
    mut stats: ResMut<RejectionStats>,
    mut sink: ResMut<EventSinkResource>,
    mut trains: Query<&mut Train>,
    mut wagons: Query<&mut Wagon>,
) {
    if event.0.kind != EventKind::HumpNext {
        return;
    }
    let Some(EventSubject::Train(train_entity)) = event.0.subject else {
        return;
    };
    let Ok(mut train) = trains.get_mut(train_entity) else {
        return;
    };
    let Some(wagon_entity) = train.to_hump.pop_front() else {
        return;
    };
    let Ok(mut wagon) = wagons.get_mut(wagon_entity) else {
        return;
    };

    let now = clock.now();
    let arrival = train.arrival_track;
    wagon.state = WagonState::Selecting;
    let decision = yard.classify(&wagon, &mut tracks, &mut rng.0);
    debug!(?wagon_entity, ?decision, "wagon humped");
    match decision {
        ClassificationDecision::Retrofit { track } => {
            // classify reserved `track` already; the wagon clears the
            // arrival track in the same step.
            tracks
                .release(arrival, wagon.length_m)
                .expect("arrival reservation exists");
            wagon.state = WagonState::Selected;
            sink.record(
                now,
                DomainEvent::WagonClassified {
                    wagon: wagon_entity,
                    track,
                },
            );
            wagon.state = WagonState::OnRetrofitTrack;
            wagon.current_track = Some(track);
            stats.retrofitted += 1;
            sink.record(
                now,
                DomainEvent::WagonMoved {
                    wagon: wagon_entity,
                    from: Some(arrival),
                    to: track,
                },
            );
            let woken = queue
                .0
                .offer(wagon_entity)
                .unwrap_or_else(|_| unreachable!("retrofit queue is unbounded"));
            if let Some(woken) = woken {
                clock.schedule_wakeup(0, woken);
            }
        }
        ClassificationDecision::Bypass | ClassificationDecision::Maintenance => {
            let maintenance = decision == ClassificationDecision::Maintenance;
            if maintenance {
                stats.maintenance += 1;
            } else {
                stats.bypassed += 1;
            }
            let candidates = tracks.ids_of_kind(TrackKind::Parking);
            match tracks.select_track(
                &candidates,
                wagon.length_m,
                strategies.parking,
                "bypass",
                &mut rng.0,
            ) {
                Some(target) => {
                    tracks
                        .reserve(target, wagon.length_m)
                        .expect("selected track fits");
                    tracks
                        .release(arrival, wagon.length_m)
                        .expect("arrival reservation exists");
                    wagon.current_track = Some(target);
                    sink.record(
                        now,
                        DomainEvent::WagonMoved {
                            wagon: wagon_entity,
                            from: Some(arrival),
                            to: target,
                        },
                    );
                }
                // No parking room: the wagon stays put on the arrival track.
                None => {}
            }
            wagon.state = WagonState::Parking;
            sink.record(
                now,
                DomainEvent::WagonBypassed {
                    wagon: wagon_entity,
                    maintenance,
                },
            );
        }
        ClassificationDecision::Reject { reason } => {
            stats.record(reason);
            tracks
                .release(arrival, wagon.length_m)
                .expect("arrival reservation exists");
            wagon.state = WagonState::Rejected;
            wagon.current_track = None;
            sink.record(
                now,
                DomainEvent::WagonRejected {
                    wagon: wagon_entity,
                    reason,
                },
            );
        }
    }

    if train.to_hump.is_empty() {
        info!(train = train.scenario_id, "train fully humped");
        sink.record(
            now,
            DomainEvent::TrainDeparted {
                train: train.scenario_id,
            },
        );
        // A half-formed rake may be waiting on this train; only Retrofit
        // decisions wake the queue consumer, so flush explicitly.
        clock.schedule_in(0, EventKind::PickupCheck, None);
    } else {
        clock.schedule_in(
            times.wagon_hump_interval,
            EventKind::HumpNext,
            Some(EventSubject::Train(train_entity)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::prelude::{Entity, Schedule, World};
    use std::collections::VecDeque;

    use crate::classification::RejectionReason;
    use crate::clock::Event;
    use crate::ecs::CouplerType;
    use crate::tracks::{SelectionStrategy, Track, TrackId};

    fn hump_world(wagon: Wagon) -> (World, Entity) {
        let mut world = World::new();
        world.insert_resource(SimulationClock::default());
        world.insert_resource(ProcessTimes::default());
        world.insert_resource(HumpYard {
            max_wagon_length_m: 35.0,
            collection_strategy: SelectionStrategy::FirstAvailable,
        });
        world.insert_resource(Strategies::default());
        world.insert_resource(SimRng::new(Some(1)));
        world.insert_resource(RetrofitQueue::default());
        world.insert_resource(RejectionStats::default());
        world.insert_resource(EventSinkResource::in_memory());

        let mut tracks = TrackRegistry::default();
        tracks.insert(Track::new(TrackId(1), TrackKind::Mainline, 100.0, 1.0));
        tracks.insert(Track::new(TrackId(2), TrackKind::Collection, 100.0, 1.0));
        tracks.insert(Track::new(TrackId(4), TrackKind::Parking, 100.0, 1.0));
        tracks
            .reserve(TrackId(1), wagon.length_m)
            .expect("arrival reservation");
        world.insert_resource(tracks);

        let wagon_entity = world.spawn(wagon).id();
        let train_entity = world
            .spawn(Train {
                scenario_id: 1,
                arrival_track: TrackId(1),
                to_hump: VecDeque::from([wagon_entity]),
            })
            .id();
        world.insert_resource(CurrentEvent(Event {
            timestamp: 0,
            seq: 0,
            kind: EventKind::HumpNext,
            subject: Some(EventSubject::Train(train_entity)),
        }));
        (world, wagon_entity)
    }

    fn wagon(needs_retrofit: bool, coupler: CouplerType) -> Wagon {
        Wagon {
            state: WagonState::Parking,
            length_m: 20.0,
            is_loaded: false,
            needs_retrofit,
            maintenance_due: false,
            coupler,
            current_track: Some(TrackId(1)),
            source_track: None,
            destination_track: None,
            retrofit_started_at: None,
            retrofit_completed_at: None,
        }
    }

    fn run(world: &mut World) {
        let mut schedule = Schedule::default();
        schedule.add_systems(hump_system);
        schedule.run(world);
    }

    #[test]
    fn retrofit_wagon_moves_to_collection_and_feeds_the_queue() {
        let (mut world, wagon_entity) = hump_world(wagon(true, CouplerType::Screw));
        run(&mut world);

        let humped = world.entity(wagon_entity).get::<Wagon>().expect("wagon");
        assert_eq!(humped.state, WagonState::OnRetrofitTrack);
        assert_eq!(humped.current_track, Some(TrackId(2)));

        let tracks = world.resource::<TrackRegistry>();
        assert!(tracks.get(TrackId(1)).expect("mainline").used_m().abs() < 1e-9);
        assert!((tracks.get(TrackId(2)).expect("collection").used_m() - 20.0).abs() < 1e-9);

        let queue = world.resource::<RetrofitQueue>();
        assert_eq!(queue.0.len(), 1);
        assert_eq!(world.resource::<RejectionStats>().retrofitted, 1);
    }

    #[test]
    fn last_wagon_departs_the_train_and_flushes_the_pickup() {
        let (mut world, _) = hump_world(wagon(true, CouplerType::Screw));
        run(&mut world);

        // No further HumpNext; one flush so a gathering rake can dispatch.
        let next = world
            .resource_mut::<SimulationClock>()
            .pop_next()
            .expect("flush event");
        assert_eq!(next.kind, EventKind::PickupCheck);
        assert!(world.resource::<SimulationClock>().is_empty());
        let sink = world.resource::<EventSinkResource>();
        let log = sink.log().expect("in-memory log");
        assert!(log
            .entries()
            .iter()
            .any(|(_, e)| matches!(e, DomainEvent::TrainDeparted { train: 1 })));
    }

    #[test]
    fn bypass_wagon_parks_without_touching_the_queue() {
        let (mut world, wagon_entity) = hump_world(wagon(false, CouplerType::Screw));
        run(&mut world);

        let humped = world.entity(wagon_entity).get::<Wagon>().expect("wagon");
        assert_eq!(humped.state, WagonState::Parking);
        assert_eq!(humped.current_track, Some(TrackId(4)));
        assert!(world.resource::<RetrofitQueue>().0.is_empty());
        assert_eq!(world.resource::<RejectionStats>().bypassed, 1);
    }

    #[test]
    fn dac_wagon_is_rejected_and_frees_the_arrival_track() {
        let (mut world, wagon_entity) = hump_world(wagon(true, CouplerType::Dac));
        run(&mut world);

        let humped = world.entity(wagon_entity).get::<Wagon>().expect("wagon");
        assert_eq!(humped.state, WagonState::Rejected);
        assert_eq!(humped.current_track, None);

        let stats = world.resource::<RejectionStats>();
        assert_eq!(stats.count(RejectionReason::CouplerMismatch), 1);
        let tracks = world.resource::<TrackRegistry>();
        assert!(tracks.get(TrackId(1)).expect("mainline").used_m().abs() < 1e-9);
    }
}
