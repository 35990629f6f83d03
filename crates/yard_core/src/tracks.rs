//! Length-based track capacity bookkeeping and track selection strategies.
//!
//! Capacity exhaustion is a normal condition here: `select_track` returning
//! `None` means "nothing fits right now", and the caller decides whether to
//! wait, retry or reject. Over-reserving past the effective capacity is the
//! misuse class and fails loudly instead.

use std::collections::HashMap;

use bevy_ecs::prelude::Resource;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TrackError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Collection,
    Retrofit,
    Workshop,
    Retrofitted,
    Parking,
    LocoParking,
    Mainline,
}

pub const DEFAULT_FILL_FACTOR: f64 = 0.75;

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: TrackId,
    pub kind: TrackKind,
    pub length_m: f64,
    /// Fraction of the physical length that is usable.
    pub fill_factor: f64,
    used_m: f64,
    /// Suspended requesters currently destined for this track, for the
    /// ShortestQueue strategy.
    waiting: usize,
}

impl Track {
    pub fn new(id: TrackId, kind: TrackKind, length_m: f64, fill_factor: f64) -> Self {
        Self {
            id,
            kind,
            length_m,
            fill_factor,
            used_m: 0.0,
            waiting: 0,
        }
    }

    pub fn effective_capacity_m(&self) -> f64 {
        self.length_m * self.fill_factor
    }

    pub fn used_m(&self) -> f64 {
        self.used_m
    }

    pub fn spare_m(&self) -> f64 {
        self.effective_capacity_m() - self.used_m
    }

    pub fn can_fit(&self, length_m: f64) -> bool {
        // Epsilon absorbs accumulated float error from repeated reserve/release.
        self.used_m + length_m <= self.effective_capacity_m() + 1e-9
    }

    pub fn waiting(&self) -> usize {
        self.waiting
    }
}

/// How a caller picks among candidate tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionStrategy {
    /// Most spare capacity.
    LeastOccupied,
    /// Alias of LeastOccupied.
    MostAvailable,
    /// First candidate that fits, in candidate order.
    FirstAvailable,
    /// Least spare capacity that still fits.
    BestFit,
    /// Rotating index, stateful per caller.
    RoundRobin,
    /// Uniform over the fitting candidates, from the seeded run RNG.
    Random,
    /// Fewest suspended requesters.
    ShortestQueue,
}

/// All tracks of the yard, insertion-ordered for deterministic iteration.
#[derive(Debug, Default, Resource)]
pub struct TrackRegistry {
    tracks: Vec<Track>,
    by_id: HashMap<TrackId, usize>,
    round_robin: HashMap<String, usize>,
}

impl TrackRegistry {
    pub fn insert(&mut self, track: Track) {
        self.by_id.insert(track.id, self.tracks.len());
        self.tracks.push(track);
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.by_id.get(&id).map(|&i| &self.tracks[i])
    }

    fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        let i = *self.by_id.get(&id)?;
        self.tracks.get_mut(i)
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Track ids of one kind, in insertion order.
    pub fn ids_of_kind(&self, kind: TrackKind) -> Vec<TrackId> {
        self.tracks
            .iter()
            .filter(|t| t.kind == kind)
            .map(|t| t.id)
            .collect()
    }

    pub fn can_fit(&self, id: TrackId, length_m: f64) -> bool {
        self.get(id).is_some_and(|t| t.can_fit(length_m))
    }

    pub fn reserve(&mut self, id: TrackId, length_m: f64) -> Result<(), TrackError> {
        let track = self.get_mut(id).ok_or(TrackError::UnknownTrack(id))?;
        if !track.can_fit(length_m) {
            return Err(TrackError::CapacityExceeded {
                track: id,
                requested_m: length_m,
                spare_m: track.spare_m(),
            });
        }
        track.used_m += length_m;
        Ok(())
    }

    pub fn release(&mut self, id: TrackId, length_m: f64) -> Result<(), TrackError> {
        let track = self.get_mut(id).ok_or(TrackError::UnknownTrack(id))?;
        if track.used_m + 1e-9 < length_m {
            return Err(TrackError::ReleaseUnderflow {
                track: id,
                requested_m: length_m,
                used_m: track.used_m,
            });
        }
        track.used_m = (track.used_m - length_m).max(0.0);
        Ok(())
    }

    pub fn note_waiter(&mut self, id: TrackId) {
        if let Some(track) = self.get_mut(id) {
            track.waiting += 1;
        }
    }

    pub fn clear_waiter(&mut self, id: TrackId) {
        if let Some(track) = self.get_mut(id) {
            track.waiting = track.waiting.saturating_sub(1);
        }
    }

    /// Total number of suspended requesters noted across all tracks.
    pub fn total_waiting(&self) -> usize {
        self.tracks.iter().map(|t| t.waiting).sum()
    }

    /// Pick a candidate with spare capacity for the whole batch, or `None`
    /// if nothing fits (capacity exhaustion, not an error). `caller` keys the
    /// RoundRobin cursor so independent call sites rotate independently.
    pub fn select_track(
        &mut self,
        candidates: &[TrackId],
        batch_length_m: f64,
        strategy: SelectionStrategy,
        caller: &str,
        rng: &mut StdRng,
    ) -> Option<TrackId> {
        let fitting: Vec<TrackId> = candidates
            .iter()
            .copied()
            .filter(|&id| self.can_fit(id, batch_length_m))
            .collect();
        if fitting.is_empty() {
            return None;
        }

        match strategy {
            SelectionStrategy::LeastOccupied | SelectionStrategy::MostAvailable => fitting
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    let sa = self.get(a).map(Track::spare_m).unwrap_or(0.0);
                    let sb = self.get(b).map(Track::spare_m).unwrap_or(0.0);
                    sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                }),
            SelectionStrategy::FirstAvailable => fitting.first().copied(),
            SelectionStrategy::BestFit => fitting
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    let sa = self.get(a).map(Track::spare_m).unwrap_or(f64::MAX);
                    let sb = self.get(b).map(Track::spare_m).unwrap_or(f64::MAX);
                    sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                }),
            SelectionStrategy::RoundRobin => {
                let cursor = self.round_robin.entry(caller.to_owned()).or_insert(0);
                let pick = fitting[*cursor % fitting.len()];
                *cursor = cursor.wrapping_add(1);
                Some(pick)
            }
            SelectionStrategy::Random => {
                let i = rng.gen_range(0..fitting.len());
                Some(fitting[i])
            }
            SelectionStrategy::ShortestQueue => fitting
                .iter()
                .copied()
                .min_by_key(|&id| self.get(id).map(Track::waiting).unwrap_or(usize::MAX)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn registry(spares: &[(u32, f64)]) -> TrackRegistry {
        let mut reg = TrackRegistry::default();
        for &(id, length) in spares {
            // fill_factor 1.0 so spare == length for readable tests
            reg.insert(Track::new(TrackId(id), TrackKind::Collection, length, 1.0));
        }
        reg
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn effective_capacity_applies_fill_factor() {
        let track = Track::new(TrackId(1), TrackKind::Collection, 100.0, DEFAULT_FILL_FACTOR);
        assert!((track.effective_capacity_m() - 75.0).abs() < 1e-9);
        assert!(track.can_fit(75.0));
        assert!(!track.can_fit(75.1));
    }

    #[test]
    fn reserve_past_capacity_is_a_loud_error() {
        let mut reg = registry(&[(1, 50.0)]);
        reg.reserve(TrackId(1), 30.0).expect("fits");
        let err = reg.reserve(TrackId(1), 30.0).expect_err("over capacity");
        assert!(matches!(err, TrackError::CapacityExceeded { .. }));
        // The failed reserve must not have mutated usage.
        assert!((reg.get(TrackId(1)).expect("track").used_m() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn release_underflow_is_a_loud_error() {
        let mut reg = registry(&[(1, 50.0)]);
        reg.reserve(TrackId(1), 10.0).expect("fits");
        let err = reg.release(TrackId(1), 20.0).expect_err("underflow");
        assert!(matches!(err, TrackError::ReleaseUnderflow { .. }));
    }

    #[test]
    fn least_occupied_picks_max_spare_and_best_fit_picks_min() {
        let mut reg = registry(&[(1, 40.0), (2, 100.0), (3, 60.0)]);
        let candidates = [TrackId(1), TrackId(2), TrackId(3)];

        let pick = reg
            .select_track(&candidates, 30.0, SelectionStrategy::LeastOccupied, "t", &mut rng())
            .expect("fit");
        assert_eq!(pick, TrackId(2));

        let pick = reg
            .select_track(&candidates, 30.0, SelectionStrategy::BestFit, "t", &mut rng())
            .expect("fit");
        assert_eq!(pick, TrackId(1));
    }

    #[test]
    fn first_available_respects_candidate_order() {
        let mut reg = registry(&[(1, 10.0), (2, 50.0), (3, 50.0)]);
        let pick = reg
            .select_track(
                &[TrackId(1), TrackId(3), TrackId(2)],
                30.0,
                SelectionStrategy::FirstAvailable,
                "t",
                &mut rng(),
            )
            .expect("fit");
        assert_eq!(pick, TrackId(3));
    }

    #[test]
    fn round_robin_rotates_per_caller() {
        let mut reg = registry(&[(1, 50.0), (2, 50.0)]);
        let candidates = [TrackId(1), TrackId(2)];
        let mut r = rng();

        let a = reg.select_track(&candidates, 10.0, SelectionStrategy::RoundRobin, "x", &mut r);
        let b = reg.select_track(&candidates, 10.0, SelectionStrategy::RoundRobin, "x", &mut r);
        let c = reg.select_track(&candidates, 10.0, SelectionStrategy::RoundRobin, "x", &mut r);
        assert_eq!(a, Some(TrackId(1)));
        assert_eq!(b, Some(TrackId(2)));
        assert_eq!(c, Some(TrackId(1)));

        // Another caller keeps its own cursor.
        let other = reg.select_track(&candidates, 10.0, SelectionStrategy::RoundRobin, "y", &mut r);
        assert_eq!(other, Some(TrackId(1)));
    }

    #[test]
    fn random_is_deterministic_per_seed_and_only_picks_fitting() {
        let mut reg = registry(&[(1, 5.0), (2, 50.0), (3, 50.0)]);
        let candidates = [TrackId(1), TrackId(2), TrackId(3)];

        let mut first_run = Vec::new();
        let mut r = StdRng::seed_from_u64(42);
        for _ in 0..8 {
            let pick = reg
                .select_track(&candidates, 10.0, SelectionStrategy::Random, "t", &mut r)
                .expect("fit");
            assert_ne!(pick, TrackId(1), "track 1 cannot fit 10m");
            first_run.push(pick);
        }

        let mut r = StdRng::seed_from_u64(42);
        let second_run: Vec<_> = (0..8)
            .map(|_| {
                reg.select_track(&candidates, 10.0, SelectionStrategy::Random, "t", &mut r)
                    .expect("fit")
            })
            .collect();
        assert_eq!(first_run, second_run);
    }

    #[test]
    fn shortest_queue_picks_fewest_waiters() {
        let mut reg = registry(&[(1, 50.0), (2, 50.0)]);
        reg.note_waiter(TrackId(1));
        reg.note_waiter(TrackId(1));
        reg.note_waiter(TrackId(2));
        let pick = reg
            .select_track(
                &[TrackId(1), TrackId(2)],
                10.0,
                SelectionStrategy::ShortestQueue,
                "t",
                &mut rng(),
            )
            .expect("fit");
        assert_eq!(pick, TrackId(2));

        reg.clear_waiter(TrackId(2));
        assert_eq!(reg.get(TrackId(2)).expect("track").waiting(), 0);
    }

    #[test]
    fn select_track_returns_none_when_nothing_fits() {
        let mut reg = registry(&[(1, 20.0), (2, 25.0)]);
        let pick = reg.select_track(
            &[TrackId(1), TrackId(2)],
            30.0,
            SelectionStrategy::LeastOccupied,
            "t",
            &mut rng(),
        );
        assert_eq!(pick, None);
    }
}
