//! Workshop station bookkeeping. Admission to a workshop is gated only by
//! its `CapacityResource`; the busy flags and completion history exist so the
//! metrics consumer can report per-station utilization afterwards.

use bevy_ecs::prelude::{Entity, Resource};
use serde::{Deserialize, Serialize};

use crate::clock::Wakeup;
use crate::error::WorkshopError;
use crate::sync::CapacityResource;
use crate::tracks::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkshopId(pub u32);

/// One completed retrofit at one physical station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationRecord {
    pub station: usize,
    pub wagon: Entity,
    pub started_at: u64,
    pub completed_at: u64,
}

#[derive(Debug)]
pub struct Workshop {
    pub id: WorkshopId,
    pub home_track: TrackId,
    /// `Some((wagon, started_at))` while the station is busy.
    stations: Vec<Option<(Entity, u64)>>,
    history: Vec<StationRecord>,
    pub admission: CapacityResource<Wakeup>,
}

impl Workshop {
    pub fn new(id: WorkshopId, home_track: TrackId, station_count: usize) -> Self {
        Self {
            id,
            home_track,
            stations: vec![None; station_count],
            history: Vec::new(),
            admission: CapacityResource::new(station_count),
        }
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn busy_stations(&self) -> usize {
        self.stations.iter().filter(|s| s.is_some()).count()
    }

    pub fn history(&self) -> &[StationRecord] {
        &self.history
    }

    /// Occupy the first idle station. Callers hold an admission grant, so a
    /// full house here is a programming error, not a blocking condition.
    pub fn mark_busy(&mut self, wagon: Entity, now: u64) -> Result<usize, WorkshopError> {
        let station = self
            .stations
            .iter()
            .position(|s| s.is_none())
            .ok_or(WorkshopError::NoIdleStation(self.id))?;
        self.stations[station] = Some((wagon, now));
        Ok(station)
    }

    /// Which station currently holds `wagon`.
    pub fn station_of(&self, wagon: Entity) -> Option<usize> {
        self.stations
            .iter()
            .position(|s| s.map(|(w, _)| w) == Some(wagon))
    }

    /// Free a station and append its completion record.
    pub fn mark_available(&mut self, station: usize, now: u64) -> Result<StationRecord, WorkshopError> {
        let slot = self
            .stations
            .get_mut(station)
            .ok_or(WorkshopError::StationNotBusy {
                workshop: self.id,
                station,
            })?;
        let (wagon, started_at) = slot.take().ok_or(WorkshopError::StationNotBusy {
            workshop: self.id,
            station,
        })?;
        let record = StationRecord {
            station,
            wagon,
            started_at,
            completed_at: now,
        };
        self.history.push(record);
        Ok(record)
    }
}

/// All workshops, insertion-ordered.
#[derive(Debug, Default, Resource)]
pub struct WorkshopRegistry {
    workshops: Vec<Workshop>,
}

impl WorkshopRegistry {
    pub fn insert(&mut self, workshop: Workshop) {
        self.workshops.push(workshop);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Workshop> {
        self.workshops.iter()
    }

    pub fn get(&self, id: WorkshopId) -> Option<&Workshop> {
        self.workshops.iter().find(|w| w.id == id)
    }

    pub fn get_mut(&mut self, id: WorkshopId) -> Option<&mut Workshop> {
        self.workshops.iter_mut().find(|w| w.id == id)
    }

    /// The workshop served by a given home track.
    pub fn by_home_track_mut(&mut self, track: TrackId) -> Option<&mut Workshop> {
        self.workshops.iter_mut().find(|w| w.home_track == track)
    }

    pub fn home_tracks(&self) -> Vec<TrackId> {
        self.workshops.iter().map(|w| w.home_track).collect()
    }

    /// Suspended admission requests across all workshops.
    pub fn total_waiting(&self) -> usize {
        self.workshops.iter().map(|w| w.admission.waiting()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::prelude::World;

    fn wagon_entity(world: &mut World) -> Entity {
        world.spawn_empty().id()
    }

    #[test]
    fn mark_busy_fills_stations_in_order_and_history_records_completion() {
        let mut world = World::new();
        let w1 = wagon_entity(&mut world);
        let w2 = wagon_entity(&mut world);

        let mut shop = Workshop::new(WorkshopId(1), TrackId(9), 2);
        assert_eq!(shop.mark_busy(w1, 10).expect("station"), 0);
        assert_eq!(shop.mark_busy(w2, 12).expect("station"), 1);
        assert_eq!(shop.busy_stations(), 2);
        assert!(matches!(
            shop.mark_busy(w1, 13),
            Err(WorkshopError::NoIdleStation(WorkshopId(1)))
        ));

        let record = shop.mark_available(0, 30).expect("record");
        assert_eq!(record.wagon, w1);
        assert_eq!(record.started_at, 10);
        assert_eq!(record.completed_at, 30);
        assert_eq!(shop.busy_stations(), 1);
        assert_eq!(shop.history().len(), 1);
    }

    #[test]
    fn freeing_an_idle_station_is_a_loud_error() {
        let mut shop = Workshop::new(WorkshopId(3), TrackId(1), 1);
        assert!(matches!(
            shop.mark_available(0, 5),
            Err(WorkshopError::StationNotBusy { .. })
        ));
        assert!(matches!(
            shop.mark_available(7, 5),
            Err(WorkshopError::StationNotBusy { .. })
        ));
    }

    #[test]
    fn registry_finds_workshop_by_home_track() {
        let mut reg = WorkshopRegistry::default();
        reg.insert(Workshop::new(WorkshopId(1), TrackId(4), 2));
        reg.insert(Workshop::new(WorkshopId(2), TrackId(8), 3));

        let shop = reg.by_home_track_mut(TrackId(8)).expect("workshop");
        assert_eq!(shop.id, WorkshopId(2));
        assert_eq!(reg.home_tracks(), vec![TrackId(4), TrackId(8)]);
    }
}
