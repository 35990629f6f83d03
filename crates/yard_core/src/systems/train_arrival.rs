use std::collections::VecDeque;

use bevy_ecs::prelude::{Commands, Query, Res, ResMut};
use tracing::{info, warn};

use crate::classification::{RejectionReason, RejectionStats};
use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock};
use crate::ecs::{Train, Wagon, WagonState};
use crate::events::{DomainEvent, EventSinkResource};
use crate::scenario::{ProcessTimes, TrainManifest};
use crate::tracks::TrackRegistry;

/// Receives a train on its arrival track: spawns the wagons, reserves
/// arrival-track capacity per wagon and kicks off the hump sequence.
pub fn train_arrival_system(
    mut commands: Commands,
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    times: Res<ProcessTimes>,
    mut tracks: ResMut<TrackRegistry>,
    mut stats: ResMut<RejectionStats>,
    mut sink: ResMut<EventSinkResource>,
    manifests: Query<&TrainManifest>,
) {
    if event.0.kind != EventKind::TrainArrived {
        return;
    }
    let Some(EventSubject::Train(train_entity)) = event.0.subject else {
        return;
    };
    let Ok(TrainManifest(spec)) = manifests.get(train_entity) else {
        return;
    };

    let now = clock.now();
    let mut to_hump = VecDeque::new();
    for wagon_spec in &spec.wagons {
        let mut wagon = Wagon {
            state: WagonState::Parking,
            length_m: wagon_spec.length_m,
            is_loaded: wagon_spec.is_loaded,
            needs_retrofit: wagon_spec.needs_retrofit,
            maintenance_due: wagon_spec.maintenance_due,
            coupler: wagon_spec.coupler,
            current_track: Some(spec.arrival_track),
            source_track: None,
            destination_track: None,
            retrofit_started_at: None,
            retrofit_completed_at: None,
        };
        match tracks.reserve(spec.arrival_track, wagon_spec.length_m) {
            Ok(()) => {
                let entity = commands.spawn(wagon).id();
                to_hump.push_back(entity);
            }
            // Validation sizes the arrival track per train, so overflow only
            // happens when trains overlap on it. The wagon never enters.
            Err(err) => {
                warn!(train = spec.id, wagon = wagon_spec.id, %err, "arrival track overflow");
                wagon.state = WagonState::Rejected;
                wagon.current_track = None;
                let entity = commands.spawn(wagon).id();
                stats.record(RejectionReason::TrackCapacityFull);
                sink.record(
                    now,
                    DomainEvent::WagonRejected {
                        wagon: entity,
                        reason: RejectionReason::TrackCapacityFull,
                    },
                );
            }
        }
    }

    info!(train = spec.id, wagons = to_hump.len(), "train arrived");
    sink.record(
        now,
        DomainEvent::TrainArrived {
            train: spec.id,
            wagons: to_hump.len(),
            track: spec.arrival_track,
        },
    );

    if to_hump.is_empty() {
        sink.record(now, DomainEvent::TrainDeparted { train: spec.id });
        return;
    }
    commands.entity(train_entity).insert(Train {
        scenario_id: spec.id,
        arrival_track: spec.arrival_track,
        to_hump,
    });
    clock.schedule_in(
        times.hump_delay,
        EventKind::HumpNext,
        Some(EventSubject::Train(train_entity)),
    );
}
