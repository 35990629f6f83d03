use bevy_ecs::prelude::{Commands, Entity, Query, Res, ResMut};
use tracing::{info, warn};

use crate::classification::{RejectionReason, RejectionStats};
use crate::clock::{CurrentEvent, EventKind, EventSubject, SimulationClock, Wakeup};
use crate::ecs::{CouplerType, JobPhase, RakeKind, Train, TransportJob, Wagon, WagonState};
use crate::events::{DomainEvent, EventSinkResource};
use crate::scenario::{MaxRakeWagons, PickupState, RetrofitQueue, RetryPolicy, SimRng, Strategies};
use crate::shunting::{couplers_compatible, form_rake, LocomotivePool};
use crate::sync::Get;
use crate::tracks::TrackRegistry;
use crate::workshops::WorkshopRegistry;

fn park_consumer(queue: &mut RetrofitQueue) {
    // Single consumer; never park a second token.
    if queue.0.waiting_getters() == 0 {
        let parked = queue.0.get(Wakeup {
            kind: EventKind::PickupCheck,
            subject: None,
        });
        debug_assert!(matches!(parked, Get::Blocked));
    }
}

/// Consumer end of the retrofit queue: gathers coupler-compatible wagons
/// standing on one collection track into a rake, then dispatches a transport
/// job towards a workshop track. Destination capacity is reserved here and
/// held until the retrofitted batch leaves the workshop track.
pub fn pickup_system(
    mut commands: Commands,
    mut clock: ResMut<SimulationClock>,
    event: Res<CurrentEvent>,
    strategies: Res<Strategies>,
    policy: Res<RetryPolicy>,
    max_rake: Res<MaxRakeWagons>,
    workshops: Res<WorkshopRegistry>,
    mut queue: ResMut<RetrofitQueue>,
    mut state: ResMut<PickupState>,
    mut pool: ResMut<LocomotivePool>,
    mut tracks: ResMut<TrackRegistry>,
    mut rng: ResMut<SimRng>,
    mut stats: ResMut<RejectionStats>,
    mut sink: ResMut<EventSinkResource>,
    mut wagons: Query<&mut Wagon>,
    trains: Query<&Train>,
) {
    if event.0.kind != EventKind::PickupCheck {
        return;
    }
    let now = clock.now();

    // Extend the forming rake with queue heads that stand on the same track
    // and couple to the last gathered wagon.
    let mut head_blocked = false;
    while state.forming.len() < max_rake.0 {
        let Some(&head) = queue.0.peek() else {
            break;
        };
        let Ok(head_wagon) = wagons.get(head) else {
            // Stale entry.
            let _ = queue.0.try_get();
            continue;
        };
        let joins = match state.forming.last() {
            None => true,
            Some(&last) => {
                let last_wagon = wagons.get(last).expect("forming wagons exist");
                last_wagon.current_track == head_wagon.current_track
                    && couplers_compatible(last_wagon.coupler, head_wagon.coupler)
            }
        };
        if !joins {
            head_blocked = true;
            break;
        }
        let (entity, woken_putter) = queue.0.try_get().expect("peeked head");
        if let Some(woken) = woken_putter {
            clock.schedule_wakeup(0, woken);
        }
        state.forming.push(entity);
    }

    if state.forming.is_empty() {
        // Nothing classified yet: suspend until the hump feeds the queue.
        park_consumer(&mut queue);
        return;
    }

    // Dispatch once the rake is full, the head cannot join it, or no more
    // wagons are coming for now. Otherwise keep gathering.
    let humping = trains.iter().any(|t| !t.to_hump.is_empty());
    let full = state.forming.len() >= max_rake.0;
    if !(full || head_blocked || (queue.0.is_empty() && !humping)) {
        park_consumer(&mut queue);
        return;
    }

    let origin = wagons
        .get(state.forming[0])
        .ok()
        .and_then(|w| w.current_track)
        .expect("forming wagons stand on a collection track");
    let batch_length: f64 = state
        .forming
        .iter()
        .filter_map(|&e| wagons.get(e).ok())
        .map(|w| w.length_m)
        .sum();

    let candidates = workshops.home_tracks();
    let Some(target) = tracks.select_track(
        &candidates,
        batch_length,
        strategies.workshop,
        "pickup",
        &mut rng.0,
    ) else {
        // Every workshop track is full: bounded retry, then give the batch up
        // so it cannot wedge the collection track forever.
        state.retries += 1;
        if !state.noted {
            for &track in &candidates {
                tracks.note_waiter(track);
            }
            state.noted = true;
        }
        if state.retries > policy.limit {
            warn!(
                wagons = state.forming.len(),
                retries = state.retries,
                "workshop capacity probe exhausted, rejecting batch"
            );
            for &track in &candidates {
                tracks.clear_waiter(track);
            }
            state.noted = false;
            state.retries = 0;
            let abandoned: Vec<Entity> = state.forming.drain(..).collect();
            for entity in abandoned {
                let Ok(mut wagon) = wagons.get_mut(entity) else {
                    continue;
                };
                if let Some(track) = wagon.current_track {
                    tracks
                        .release(track, wagon.length_m)
                        .expect("collection reservation exists");
                }
                wagon.state = WagonState::Rejected;
                wagon.current_track = None;
                stats.record(RejectionReason::WorkshopUnavailable);
                sink.record(
                    now,
                    DomainEvent::WagonRejected {
                        wagon: entity,
                        reason: RejectionReason::WorkshopUnavailable,
                    },
                );
            }
            // Wagons classified during the retries were offered with no
            // consumer parked; pick them up instead of suspending past them.
            if !queue.0.is_empty() {
                clock.schedule_in(0, EventKind::PickupCheck, None);
            } else {
                park_consumer(&mut queue);
            }
        } else {
            clock.schedule_in(policy.interval_ticks, EventKind::PickupCheck, None);
        }
        return;
    };

    if state.noted {
        for &track in &candidates {
            tracks.clear_waiter(track);
        }
        state.noted = false;
    }
    state.retries = 0;

    tracks
        .reserve(target, batch_length)
        .expect("selected track fits");
    let members: Vec<(Entity, CouplerType)> = state
        .forming
        .iter()
        .filter_map(|&e| wagons.get(e).ok().map(|w| (e, w.coupler)))
        .collect();
    let rake = form_rake(RakeKind::Workshop, &members, max_rake.0, origin, target, now)
        .expect("gathered wagons couple pairwise");
    state.forming.clear();

    let wagon_count = members.len();
    let rake_entity = commands.spawn(rake).id();
    sink.record(
        now,
        DomainEvent::RakeFormed {
            rake: rake_entity,
            kind: RakeKind::Workshop,
            wagons: wagon_count,
            origin,
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
    info!(wagons = wagon_count, ?origin, ?target, "workshop rake dispatched");

    // More classified wagons may already sit behind the dispatched batch.
    if !queue.0.is_empty() {
        clock.schedule_in(0, EventKind::PickupCheck, None);
    } else {
        park_consumer(&mut queue);
    }
}
