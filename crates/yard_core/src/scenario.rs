//! Scenario setup: the typed interface the excluded config/parsing
//! collaborators populate, its validation (fatal before the first event),
//! and `build_scenario`, which turns a validated scenario into world state.

use std::collections::{HashMap, VecDeque};

use bevy_ecs::prelude::{Entity, Resource, World};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::classification::{HumpYard, RejectionStats};
use crate::clock::{EventKind, EventSubject, SimulationClock, TickScale, Wakeup};
use crate::ecs::{CouplerType, Locomotive, LocomotiveStatus};
use crate::error::ConfigError;
use crate::events::EventSinkResource;
use crate::shunting::{CouplerTimes, LocomotivePool};
use crate::sync::{BoundedQueue, Get};
use crate::tracks::{SelectionStrategy, Track, TrackId, TrackKind, TrackRegistry, DEFAULT_FILL_FACTOR};
use crate::workshops::{Workshop, WorkshopRegistry};

fn default_fill_factor() -> f64 {
    DEFAULT_FILL_FACTOR
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WagonSpec {
    pub id: u32,
    pub length_m: f64,
    pub is_loaded: bool,
    pub needs_retrofit: bool,
    #[serde(default)]
    pub maintenance_due: bool,
    pub coupler: CouplerType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSpec {
    pub id: u32,
    pub arrival_tick: u64,
    pub arrival_track: TrackId,
    pub wagons: Vec<WagonSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackSpec {
    pub id: TrackId,
    pub kind: TrackKind,
    pub length_m: f64,
    #[serde(default = "default_fill_factor")]
    pub fill_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkshopSpec {
    pub id: u32,
    pub home_track: TrackId,
    pub stations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocomotiveSpec {
    pub id: u32,
    pub home_track: TrackId,
    pub max_wagons: usize,
}

/// One undirected route edge with its traversal time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub from: TrackId,
    pub to: TrackId,
    pub duration_ticks: u64,
}

/// Per-operation process times, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Resource, Serialize, Deserialize)]
pub struct ProcessTimes {
    pub hump_delay: u64,
    pub wagon_hump_interval: u64,
    pub coupling: CouplerTimes,
    pub decoupling: CouplerTimes,
    /// Shunt from the workshop home track into a free station.
    pub station_transfer: u64,
    pub retrofit_duration: u64,
}

impl Default for ProcessTimes {
    fn default() -> Self {
        Self {
            hump_delay: 2,
            wagon_hump_interval: 1,
            coupling: CouplerTimes {
                screw: 5,
                dac: 1,
                hybrid: 2,
            },
            decoupling: CouplerTimes {
                screw: 3,
                dac: 1,
                hybrid: 2,
            },
            station_transfer: 0,
            retrofit_duration: 60,
        }
    }
}

/// Selection strategy per resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Resource, Serialize, Deserialize)]
pub struct Strategies {
    pub collection: SelectionStrategy,
    pub workshop: SelectionStrategy,
    pub parking: SelectionStrategy,
}

impl Default for Strategies {
    fn default() -> Self {
        Self {
            collection: SelectionStrategy::LeastOccupied,
            workshop: SelectionStrategy::FirstAvailable,
            parking: SelectionStrategy::LeastOccupied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub trains: Vec<TrainSpec>,
    pub tracks: Vec<TrackSpec>,
    pub workshops: Vec<WorkshopSpec>,
    pub locomotives: Vec<LocomotiveSpec>,
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub process_times: ProcessTimes,
    #[serde(default)]
    pub strategies: Strategies,
    #[serde(default)]
    pub tick_scale: TickScale,
    /// Seed for the run RNG; equal seeds give identical event traces.
    pub seed: Option<u64>,
    #[serde(default = "Scenario::default_max_wagon_length")]
    pub max_wagon_length_m: f64,
    /// Bound for capacity-probe retries before the probe gives up.
    #[serde(default = "Scenario::default_retry_limit")]
    pub capacity_retry_limit: u32,
    /// Optional simulation horizon; events at or past it do not run.
    pub end_tick: Option<u64>,
}

impl Scenario {
    fn default_max_wagon_length() -> f64 {
        35.0
    }

    fn default_retry_limit() -> u32 {
        16
    }

    /// Fatal configuration check, run once before simulation start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trains.is_empty() {
            return Err(ConfigError::NoTrains);
        }
        if self.tracks.is_empty() {
            return Err(ConfigError::NoTracks);
        }
        if self.locomotives.is_empty() {
            return Err(ConfigError::NoLocomotives);
        }

        let mut known = HashMap::new();
        for track in &self.tracks {
            if track.fill_factor <= 0.0 || track.fill_factor > 1.0 {
                return Err(ConfigError::InvalidFillFactor(track.id, track.fill_factor));
            }
            known.insert(track.id, track.length_m * track.fill_factor);
        }

        for workshop in &self.workshops {
            if workshop.stations == 0 {
                return Err(ConfigError::ZeroStationWorkshop(workshop.id));
            }
            if !known.contains_key(&workshop.home_track) {
                return Err(ConfigError::UnknownTrack(workshop.home_track));
            }
        }

        for loco in &self.locomotives {
            if loco.max_wagons == 0 {
                return Err(ConfigError::ZeroCapacityLocomotive(loco.id));
            }
            if !known.contains_key(&loco.home_track) {
                return Err(ConfigError::UnknownTrack(loco.home_track));
            }
        }

        for route in &self.routes {
            for id in [route.from, route.to] {
                if !known.contains_key(&id) {
                    return Err(ConfigError::UnknownTrack(id));
                }
            }
        }

        for train in &self.trains {
            let capacity = *known
                .get(&train.arrival_track)
                .ok_or(ConfigError::UnknownTrack(train.arrival_track))?;
            let mut total = 0.0;
            for wagon in &train.wagons {
                if wagon.length_m <= 0.0 {
                    return Err(ConfigError::NonPositiveWagonLength {
                        train: train.id,
                        wagon: wagon.id,
                        length_m: wagon.length_m,
                    });
                }
                total += wagon.length_m;
            }
            if total > capacity + 1e-9 {
                return Err(ConfigError::ArrivalTrackTooShort {
                    train: train.id,
                    track: train.arrival_track,
                    total_m: total,
                    capacity_m: capacity,
                });
            }
        }

        // Transport legs the orchestration will ask for must have routes:
        // locomotives reach collection tracks (from home or a parking track
        // after a completed job), rakes reach a workshop, and retrofitted
        // rakes reach parking.
        let routes = RouteTable::from_specs(&self.routes);
        let collection: Vec<TrackId> = self.kind_ids(TrackKind::Collection);
        let parking: Vec<TrackId> = self.kind_ids(TrackKind::Parking);
        for workshop in &self.workshops {
            for &from in &collection {
                if routes.route_ticks(from, workshop.home_track).is_none() {
                    return Err(ConfigError::MissingRoute {
                        from,
                        to: workshop.home_track,
                    });
                }
            }
            for &to in &parking {
                if routes.route_ticks(workshop.home_track, to).is_none() {
                    return Err(ConfigError::MissingRoute {
                        from: workshop.home_track,
                        to,
                    });
                }
            }
            for loco in &self.locomotives {
                if routes
                    .route_ticks(loco.home_track, workshop.home_track)
                    .is_none()
                {
                    return Err(ConfigError::MissingRoute {
                        from: loco.home_track,
                        to: workshop.home_track,
                    });
                }
            }
            for other in &self.workshops {
                if routes
                    .route_ticks(workshop.home_track, other.home_track)
                    .is_none()
                {
                    return Err(ConfigError::MissingRoute {
                        from: workshop.home_track,
                        to: other.home_track,
                    });
                }
            }
        }
        for &to in &collection {
            for loco in &self.locomotives {
                if routes.route_ticks(loco.home_track, to).is_none() {
                    return Err(ConfigError::MissingRoute {
                        from: loco.home_track,
                        to,
                    });
                }
            }
            for &from in &parking {
                if routes.route_ticks(from, to).is_none() {
                    return Err(ConfigError::MissingRoute { from, to });
                }
            }
        }

        Ok(())
    }

    fn kind_ids(&self, kind: TrackKind) -> Vec<TrackId> {
        self.tracks
            .iter()
            .filter(|t| t.kind == kind)
            .map(|t| t.id)
            .collect()
    }
}

/// Traversal times per track pair. Edges are undirected; a track reaches
/// itself in zero ticks.
#[derive(Debug, Default, Resource)]
pub struct RouteTable {
    edges: HashMap<(TrackId, TrackId), u64>,
}

impl RouteTable {
    pub fn from_specs(specs: &[RouteSpec]) -> Self {
        let mut edges = HashMap::new();
        for spec in specs {
            edges.insert((spec.from, spec.to), spec.duration_ticks);
        }
        Self { edges }
    }

    pub fn route_ticks(&self, from: TrackId, to: TrackId) -> Option<u64> {
        if from == to {
            return Some(0);
        }
        self.edges
            .get(&(from, to))
            .or_else(|| self.edges.get(&(to, from)))
            .copied()
    }
}

/// The run RNG: one seeded stream so RANDOM selections replay identically.
#[derive(Resource)]
pub struct SimRng(pub StdRng);

impl SimRng {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self(rng)
    }
}

/// FIFO buffer between the hump and the pickup process.
#[derive(Resource)]
pub struct RetrofitQueue(pub BoundedQueue<Entity, Wakeup>);

impl Default for RetrofitQueue {
    fn default() -> Self {
        Self(BoundedQueue::new(None))
    }
}

/// Pickup process state: the rake being gathered and its capacity-probe
/// retry count.
#[derive(Debug, Default, Resource)]
pub struct PickupState {
    pub forming: Vec<Entity>,
    pub retries: u32,
    /// Whether the blocked probe has been counted in the track waiter stats.
    pub noted: bool,
}

/// Largest rake any locomotive of the fleet can haul.
#[derive(Debug, Clone, Copy, Resource)]
pub struct MaxRakeWagons(pub usize);

/// Bound for capacity-probe retry loops.
#[derive(Debug, Clone, Copy, Resource)]
pub struct RetryPolicy {
    pub limit: u32,
    pub interval_ticks: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: Scenario::default_retry_limit(),
            interval_ticks: 1,
        }
    }
}

/// Optional horizon: events at or past this tick do not run.
#[derive(Debug, Clone, Copy, Resource)]
pub struct SimulationEndTick(pub u64);

/// Wagon manifest of a train that has not arrived yet.
#[derive(Debug, Clone, bevy_ecs::prelude::Component)]
pub struct TrainManifest(pub TrainSpec);

/// Populates `world` with every resource, spawns locomotives and pending
/// trains, and schedules their arrival events.
pub fn build_scenario(world: &mut World, scenario: &Scenario) -> Result<(), ConfigError> {
    scenario.validate()?;

    world.insert_resource(SimulationClock::new(scenario.tick_scale));
    world.insert_resource(SimRng::new(scenario.seed));
    world.insert_resource(scenario.process_times);
    world.insert_resource(scenario.strategies);
    world.insert_resource(HumpYard {
        max_wagon_length_m: scenario.max_wagon_length_m,
        collection_strategy: scenario.strategies.collection,
    });
    world.insert_resource(RejectionStats::default());
    // The pickup process starts suspended on the empty queue; the first
    // classified wagon wakes it.
    let mut queue = RetrofitQueue::default();
    let armed = queue.0.get(Wakeup {
        kind: EventKind::PickupCheck,
        subject: None,
    });
    debug_assert!(matches!(armed, Get::Blocked));
    world.insert_resource(queue);
    world.insert_resource(PickupState::default());
    world.insert_resource(RetryPolicy {
        limit: scenario.capacity_retry_limit,
        interval_ticks: 1,
    });
    world.insert_resource(RouteTable::from_specs(&scenario.routes));
    world.insert_resource(EventSinkResource::in_memory());
    if let Some(end) = scenario.end_tick {
        world.insert_resource(SimulationEndTick(end));
    }

    let mut tracks = TrackRegistry::default();
    for spec in &scenario.tracks {
        tracks.insert(Track::new(spec.id, spec.kind, spec.length_m, spec.fill_factor));
    }
    world.insert_resource(tracks);

    let mut workshops = WorkshopRegistry::default();
    for spec in &scenario.workshops {
        workshops.insert(Workshop::new(
            crate::workshops::WorkshopId(spec.id),
            spec.home_track,
            spec.stations,
        ));
    }
    world.insert_resource(workshops);

    let mut fleet = Vec::with_capacity(scenario.locomotives.len());
    for spec in &scenario.locomotives {
        let entity = world
            .spawn(Locomotive {
                status: LocomotiveStatus::Parking,
                home_track: spec.home_track,
                current_track: spec.home_track,
                max_wagons: spec.max_wagons,
            })
            .id();
        fleet.push(entity);
    }
    let max_rake = scenario
        .locomotives
        .iter()
        .map(|l| l.max_wagons)
        .min()
        .unwrap_or(1);
    world.insert_resource(MaxRakeWagons(max_rake));

    // Reverse so pool.allocate (a stack pop) hands out fleet order.
    fleet.reverse();
    world.insert_resource(LocomotivePool::new(fleet));

    for train in &scenario.trains {
        let entity = world.spawn(TrainManifest(train.clone())).id();
        world
            .resource_mut::<SimulationClock>()
            .schedule_at(
                train.arrival_tick,
                EventKind::TrainArrived,
                Some(EventSubject::Train(entity)),
            )
            .expect("fresh clock starts at tick 0");
    }

    Ok(())
}

/// A minimal single-train scenario used across tests.
pub fn example_scenario() -> Scenario {
    let mainline = TrackId(1);
    let collection = TrackId(2);
    let workshop_track = TrackId(3);
    let parking = TrackId(4);
    let loco_parking = TrackId(5);

    Scenario {
        trains: vec![TrainSpec {
            id: 1,
            arrival_tick: 0,
            arrival_track: mainline,
            wagons: (0..4)
                .map(|i| WagonSpec {
                    id: i,
                    length_m: 20.0,
                    is_loaded: false,
                    needs_retrofit: true,
                    maintenance_due: false,
                    coupler: CouplerType::Screw,
                })
                .collect(),
        }],
        tracks: vec![
            TrackSpec {
                id: mainline,
                kind: TrackKind::Mainline,
                length_m: 200.0,
                fill_factor: 1.0,
            },
            TrackSpec {
                id: collection,
                kind: TrackKind::Collection,
                length_m: 200.0,
                fill_factor: 1.0,
            },
            TrackSpec {
                id: workshop_track,
                kind: TrackKind::Workshop,
                length_m: 200.0,
                fill_factor: 1.0,
            },
            TrackSpec {
                id: parking,
                kind: TrackKind::Parking,
                length_m: 400.0,
                fill_factor: 1.0,
            },
            TrackSpec {
                id: loco_parking,
                kind: TrackKind::LocoParking,
                length_m: 50.0,
                fill_factor: 1.0,
            },
        ],
        workshops: vec![WorkshopSpec {
            id: 1,
            home_track: workshop_track,
            stations: 4,
        }],
        locomotives: vec![LocomotiveSpec {
            id: 1,
            home_track: loco_parking,
            max_wagons: 8,
        }],
        routes: vec![
            RouteSpec {
                from: loco_parking,
                to: collection,
                duration_ticks: 0,
            },
            RouteSpec {
                from: loco_parking,
                to: workshop_track,
                duration_ticks: 0,
            },
            RouteSpec {
                from: collection,
                to: workshop_track,
                duration_ticks: 0,
            },
            RouteSpec {
                from: workshop_track,
                to: parking,
                duration_ticks: 0,
            },
            RouteSpec {
                from: parking,
                to: collection,
                duration_ticks: 0,
            },
        ],
        process_times: ProcessTimes {
            hump_delay: 0,
            wagon_hump_interval: 0,
            coupling: CouplerTimes {
                screw: 0,
                dac: 0,
                hybrid: 0,
            },
            decoupling: CouplerTimes {
                screw: 0,
                dac: 0,
                hybrid: 0,
            },
            station_transfer: 0,
            retrofit_duration: 10,
        },
        strategies: Strategies::default(),
        tick_scale: TickScale::default(),
        seed: Some(42),
        max_wagon_length_m: 35.0,
        capacity_retry_limit: 16,
        end_tick: None,
    }
}
