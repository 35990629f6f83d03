//! Hump yard classification: decides, per wagon, whether it enters the
//! retrofit pipeline, bypasses it, leaves for maintenance, or is rejected.
//! A RETROFIT decision reserves collection-track capacity immediately; the
//! caller must not re-check.

use bevy_ecs::prelude::Resource;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::ecs::{CouplerType, Wagon};
use crate::tracks::{SelectionStrategy, TrackId, TrackKind, TrackRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    TrackCapacityFull,
    CouplerMismatch,
    WagonTooLong,
    NoSuitableTrack,
    WorkshopUnavailable,
    TechnicalIssue,
}

impl RejectionReason {
    /// Declaration order; doubles as the tie-break order for `top_reason`.
    pub const ALL: [RejectionReason; 6] = [
        RejectionReason::TrackCapacityFull,
        RejectionReason::CouplerMismatch,
        RejectionReason::WagonTooLong,
        RejectionReason::NoSuitableTrack,
        RejectionReason::WorkshopUnavailable,
        RejectionReason::TechnicalIssue,
    ];

    fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|&r| r == self)
            .unwrap_or(Self::ALL.len() - 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ClassificationDecision {
    /// Enter the pipeline; collection capacity on `track` is already reserved.
    Retrofit { track: TrackId },
    /// Not a failure: the wagon simply does not need a retrofit.
    Bypass,
    /// Leaves the pipeline for the maintenance exit; counted separately.
    Maintenance,
    Reject { reason: RejectionReason },
}

/// Per-reason rejection counters plus overall decision counts.
#[derive(Debug, Clone, Default, Resource)]
pub struct RejectionStats {
    total: u64,
    by_reason: [u64; RejectionReason::ALL.len()],
    pub retrofitted: u64,
    pub bypassed: u64,
    pub maintenance: u64,
}

impl RejectionStats {
    pub fn record(&mut self, reason: RejectionReason) {
        self.total += 1;
        self.by_reason[reason.index()] += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn count(&self, reason: RejectionReason) -> u64 {
        self.by_reason[reason.index()]
    }

    /// Highest-count reason and its share of all rejections. Ties go to the
    /// first reason in declaration order that reaches the maximum.
    pub fn top_reason(&self) -> Option<(RejectionReason, f64)> {
        if self.total == 0 {
            return None;
        }
        let mut best = RejectionReason::ALL[0];
        let mut best_count = self.by_reason[0];
        for (i, &reason) in RejectionReason::ALL.iter().enumerate().skip(1) {
            if self.by_reason[i] > best_count {
                best = reason;
                best_count = self.by_reason[i];
            }
        }
        Some((best, best_count as f64 * 100.0 / self.total as f64))
    }

    pub fn top_reason_summary(&self) -> Option<String> {
        self.top_reason()
            .map(|(reason, pct)| format!("{reason:?} ({pct:.1}% of {} rejections)", self.total))
    }
}

/// Hump yard configuration.
#[derive(Debug, Clone, Copy, Resource)]
pub struct HumpYard {
    pub max_wagon_length_m: f64,
    pub collection_strategy: SelectionStrategy,
}

impl HumpYard {
    /// Classify one wagon. Exactly one of four outcomes; on Retrofit the
    /// selected collection track already carries the reservation.
    pub fn classify(
        &self,
        wagon: &Wagon,
        tracks: &mut TrackRegistry,
        rng: &mut StdRng,
    ) -> ClassificationDecision {
        if wagon.maintenance_due {
            return ClassificationDecision::Maintenance;
        }
        if !wagon.needs_retrofit {
            return ClassificationDecision::Bypass;
        }
        // The retrofit programme converts screw couplers to DAC; a wagon that
        // already carries a pure DAC head cannot take the conversion.
        if wagon.coupler == CouplerType::Dac {
            return ClassificationDecision::Reject {
                reason: RejectionReason::CouplerMismatch,
            };
        }
        if wagon.length_m > self.max_wagon_length_m {
            return ClassificationDecision::Reject {
                reason: RejectionReason::WagonTooLong,
            };
        }

        let candidates = tracks.ids_of_kind(TrackKind::Collection);
        if candidates.is_empty() {
            return ClassificationDecision::Reject {
                reason: RejectionReason::NoSuitableTrack,
            };
        }

        match tracks.select_track(
            &candidates,
            wagon.length_m,
            self.collection_strategy,
            "classification",
            rng,
        ) {
            Some(track) => match tracks.reserve(track, wagon.length_m) {
                Ok(()) => ClassificationDecision::Retrofit { track },
                // select_track said it fits; a failing reserve is unexpected
                // but surfaces as a rejection rather than corrupting state.
                Err(_) => ClassificationDecision::Reject {
                    reason: RejectionReason::TechnicalIssue,
                },
            },
            None => ClassificationDecision::Reject {
                reason: RejectionReason::TrackCapacityFull,
            },
        }
    }
}
