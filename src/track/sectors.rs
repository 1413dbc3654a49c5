// Sector map and sector timing state machine

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::LaptraceError;
use crate::telemetry::VehicleId;

/// Lap-distance drop that marks a lap rollover
pub const DEFAULT_ROLLOVER_THRESHOLD_M: f64 = 100.0;
/// A vehicle first seen within this distance of the line starts a timed lap
pub const DEFAULT_START_TOLERANCE_M: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectorBoundary {
    pub sector_index: usize,
    /// Lap distance at which the sector starts
    pub start_distance: f64,
}

/// Ordered sector boundaries of one track, wrapping at the track length
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorMap {
    pub track_length_m: f64,
    pub sectors: Vec<SectorBoundary>,
}

impl SectorMap {
    pub fn new(track_length_m: f64, start_distances: &[f64]) -> Result<Self, LaptraceError> {
        let invalid = |reason: String| Err(LaptraceError::InvalidSectorMap { reason });
        if !(track_length_m > 0.0) || !track_length_m.is_finite() {
            return invalid(format!("track length {track_length_m} must be positive"));
        }
        if start_distances.first() != Some(&0.0) {
            return invalid("the first sector must start at 0".to_string());
        }
        if start_distances.windows(2).any(|pair| !(pair[0] < pair[1])) {
            return invalid("sector starts must be strictly increasing".to_string());
        }
        if start_distances.iter().any(|d| *d >= track_length_m) {
            return invalid(format!(
                "sector starts must lie within the {track_length_m:.1}m track"
            ));
        }
        Ok(Self {
            track_length_m,
            sectors: start_distances
                .iter()
                .enumerate()
                .map(|(sector_index, start_distance)| SectorBoundary {
                    sector_index,
                    start_distance: *start_distance,
                })
                .collect(),
        })
    }

    /// `count` sectors of equal length
    pub fn equal(track_length_m: f64, count: usize) -> Result<Self, LaptraceError> {
        if count == 0 {
            return Err(LaptraceError::InvalidSectorMap {
                reason: "at least one sector is required".to_string(),
            });
        }
        let starts: Vec<f64> = (0..count)
            .map(|i| track_length_m * i as f64 / count as f64)
            .collect();
        Self::new(track_length_m, &starts)
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    /// Sector containing a lap distance
    pub fn sector_at(&self, distance: f64) -> usize {
        self.sectors
            .partition_point(|s| s.start_distance <= distance)
            .saturating_sub(1)
    }
}

/// Fastest time seen for one sector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorBest {
    pub time_s: f64,
    pub vehicle_id: VehicleId,
    pub lap_number: u32,
}

/// Best time per sector across all vehicles
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SectorLeaderboard {
    best: Vec<Option<SectorBest>>,
}

impl SectorLeaderboard {
    pub fn new(sector_count: usize) -> Self {
        Self {
            best: vec![None; sector_count],
        }
    }

    pub fn best_times(&self) -> &[Option<SectorBest>] {
        &self.best
    }

    /// Record a sector time, returning the delta to the previous best and whether it is a new best
    pub fn record(
        &mut self,
        sector_index: usize,
        elapsed_s: f64,
        vehicle_id: &str,
        lap_number: u32,
    ) -> (Option<f64>, bool) {
        let Some(slot) = self.best.get_mut(sector_index) else {
            return (None, false);
        };
        let delta = slot.as_ref().map(|best| elapsed_s - best.time_s);
        let new_best = delta.is_none_or(|d| d < 0.0);
        if new_best {
            *slot = Some(SectorBest {
                time_s: elapsed_s,
                vehicle_id: vehicle_id.to_string(),
                lap_number,
            });
        }
        (delta, new_best)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SectorEvent {
    SectorEntered {
        vehicle_id: VehicleId,
        lap_number: u32,
        sector_index: usize,
        time: f64,
    },
    SectorCompleted {
        vehicle_id: VehicleId,
        lap_number: u32,
        sector_index: usize,
        time: f64,
        elapsed_s: f64,
        delta_to_best_s: Option<f64>,
        new_best: bool,
    },
    LapCompleted {
        vehicle_id: VehicleId,
        lap_number: u32,
        time: f64,
        lap_time_s: f64,
        sector_times: Vec<f64>,
    },
}

impl SectorEvent {
    pub fn time(&self) -> f64 {
        match self {
            Self::SectorEntered { time, .. }
            | Self::SectorCompleted { time, .. }
            | Self::LapCompleted { time, .. } => *time,
        }
    }

    pub fn vehicle_id(&self) -> &str {
        match self {
            Self::SectorEntered { vehicle_id, .. }
            | Self::SectorCompleted { vehicle_id, .. }
            | Self::LapCompleted { vehicle_id, .. } => vehicle_id,
        }
    }
}

/// Per-vehicle sector state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorTimingState {
    pub lap_number: u32,
    pub current_sector: usize,
    pub sector_entry_time: f64,
    pub completed_sector_times: Vec<f64>,
    pub lap_start_time: f64,
    /// The current sector was entered on its boundary, so its time is meaningful
    sector_timed: bool,
    /// The current lap started on the line
    lap_timed: bool,
    last_distance: f64,
}

/// Drives every vehicle's sector state from (time, lap distance) updates.
///
/// Updates for one vehicle must arrive with non-decreasing time. Sector bests
/// are shared by all vehicles fed to the same engine.
pub struct SectorTimingEngine {
    map: SectorMap,
    rollover_threshold_m: f64,
    start_tolerance_m: f64,
    min_lap_duration_s: f64,
    states: HashMap<VehicleId, SectorTimingState>,
    leaderboard: SectorLeaderboard,
}

impl SectorTimingEngine {
    pub fn new(map: Option<SectorMap>) -> Result<Self, LaptraceError> {
        let map = map.ok_or(LaptraceError::MissingSectorMap)?;
        if map.is_empty() {
            return Err(LaptraceError::MissingSectorMap);
        }
        Ok(Self {
            leaderboard: SectorLeaderboard::new(map.len()),
            map,
            rollover_threshold_m: DEFAULT_ROLLOVER_THRESHOLD_M,
            start_tolerance_m: DEFAULT_START_TOLERANCE_M,
            min_lap_duration_s: 0.0,
            states: HashMap::new(),
        })
    }

    pub fn with_thresholds(mut self, rollover_threshold_m: f64, start_tolerance_m: f64) -> Self {
        self.rollover_threshold_m = rollover_threshold_m;
        self.start_tolerance_m = start_tolerance_m;
        self
    }

    /// Distance rollovers sooner than this after the lap started are ignored
    pub fn with_min_lap_duration(mut self, min_lap_duration_s: f64) -> Self {
        self.min_lap_duration_s = min_lap_duration_s;
        self
    }

    pub fn map(&self) -> &SectorMap {
        &self.map
    }

    pub fn state(&self, vehicle_id: &str) -> Option<&SectorTimingState> {
        self.states.get(vehicle_id)
    }

    pub fn best_times(&self) -> &[Option<SectorBest>] {
        self.leaderboard.best_times()
    }

    /// Advance one vehicle to `time` at `lap_distance`, returning the events this caused.
    ///
    /// The lap rolls over when the distance wraps from the last
    /// `rollover_threshold_m` of the lap to within that distance of the line,
    /// at least the minimum lap duration after the lap started. A single bad
    /// sample mid-lap never opens a lap.
    pub fn update(&mut self, vehicle_id: &str, time: f64, lap_distance: f64) -> Vec<SectorEvent> {
        self.advance(vehicle_id, time, lap_distance, None)
    }

    /// Like [`update`](Self::update) for vehicles whose lap boundaries are
    /// already known; `lap_start` marks the first sample of a new lap and the
    /// distance never rolls the lap over on its own.
    pub fn update_with_boundary(
        &mut self,
        vehicle_id: &str,
        time: f64,
        lap_distance: f64,
        lap_start: bool,
    ) -> Vec<SectorEvent> {
        self.advance(vehicle_id, time, lap_distance, Some(lap_start))
    }

    fn advance(
        &mut self,
        vehicle_id: &str,
        time: f64,
        lap_distance: f64,
        lap_start: Option<bool>,
    ) -> Vec<SectorEvent> {
        let mut events = Vec::new();
        let Some(state) = self.states.get_mut(vehicle_id) else {
            let on_line = lap_distance <= self.start_tolerance_m;
            let current_sector = self.map.sector_at(lap_distance);
            events.push(SectorEvent::SectorEntered {
                vehicle_id: vehicle_id.to_string(),
                lap_number: 1,
                sector_index: current_sector,
                time,
            });
            self.states.insert(
                vehicle_id.to_string(),
                SectorTimingState {
                    lap_number: 1,
                    current_sector,
                    sector_entry_time: time,
                    completed_sector_times: Vec::new(),
                    lap_start_time: time,
                    sector_timed: on_line,
                    lap_timed: on_line,
                    last_distance: lap_distance,
                },
            );
            return events;
        };

        let lap_tail = self.map.track_length_m - self.rollover_threshold_m;
        let rollover = lap_start.unwrap_or_else(|| {
            state.last_distance >= lap_tail
                && lap_distance <= self.rollover_threshold_m
                && time - state.lap_start_time >= self.min_lap_duration_s
        });
        if rollover {
            complete_sector(state, &mut self.leaderboard, vehicle_id, time, &mut events);
            if state.lap_timed && state.completed_sector_times.len() == self.map.len() {
                events.push(SectorEvent::LapCompleted {
                    vehicle_id: vehicle_id.to_string(),
                    lap_number: state.lap_number,
                    time,
                    lap_time_s: time - state.lap_start_time,
                    sector_times: std::mem::take(&mut state.completed_sector_times),
                });
            } else {
                debug!(
                    "Lap {} of {} was not timed from the line",
                    state.lap_number, vehicle_id
                );
            }
            state.lap_number += 1;
            state.current_sector = 0;
            state.sector_entry_time = time;
            state.lap_start_time = time;
            state.completed_sector_times.clear();
            state.sector_timed = true;
            state.lap_timed = true;
            state.last_distance = 0.0;
            events.push(SectorEvent::SectorEntered {
                vehicle_id: vehicle_id.to_string(),
                lap_number: state.lap_number,
                sector_index: 0,
                time,
            });
        }

        // Just past the line, a distance from the end of the lap is jitter across the seam
        if state.current_sector == 0
            && state.last_distance <= self.rollover_threshold_m
            && lap_distance >= lap_tail
        {
            return events;
        }
        while state.current_sector + 1 < self.map.len()
            && lap_distance >= self.map.sectors[state.current_sector + 1].start_distance
        {
            complete_sector(state, &mut self.leaderboard, vehicle_id, time, &mut events);
            state.current_sector += 1;
            state.sector_entry_time = time;
            state.sector_timed = true;
            events.push(SectorEvent::SectorEntered {
                vehicle_id: vehicle_id.to_string(),
                lap_number: state.lap_number,
                sector_index: state.current_sector,
                time,
            });
        }
        state.last_distance = lap_distance;
        events
    }
}

fn complete_sector(
    state: &mut SectorTimingState,
    leaderboard: &mut SectorLeaderboard,
    vehicle_id: &str,
    time: f64,
    events: &mut Vec<SectorEvent>,
) {
    if !state.sector_timed {
        return;
    }
    let elapsed_s = time - state.sector_entry_time;
    let (delta_to_best_s, new_best) =
        leaderboard.record(state.current_sector, elapsed_s, vehicle_id, state.lap_number);
    state.completed_sector_times.push(elapsed_s);
    events.push(SectorEvent::SectorCompleted {
        vehicle_id: vehicle_id.to_string(),
        lap_number: state.lap_number,
        sector_index: state.current_sector,
        time,
        elapsed_s,
        delta_to_best_s,
        new_best,
    });
}

/// Sector state of one vehicle at one moment of the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorTimingSnapshot {
    pub vehicle_id: VehicleId,
    pub time: f64,
    pub lap_number: u32,
    pub current_sector: usize,
    pub sector_entry_time: f64,
    pub elapsed_in_sector_s: f64,
    /// Sectors finished so far in the current lap, in order
    pub completed_sector_times: Vec<f64>,
    /// Delta of each completed sector to the best known when it was completed
    pub deltas_to_best_s: Vec<Option<f64>>,
    /// Session bests as known at `time`
    pub best_times: Vec<Option<SectorBest>>,
}

/// Time-ordered sector events of a whole session
#[derive(Debug, Clone, Default)]
pub struct SectorTimeline {
    sector_count: usize,
    events: Vec<SectorEvent>,
    by_vehicle: HashMap<VehicleId, Vec<usize>>,
}

impl SectorTimeline {
    /// Merge independently produced per-vehicle event streams.
    ///
    /// Each stream's deltas only know that vehicle's own bests; merging replays
    /// every sector completion in time order through one leaderboard so deltas
    /// refer to the best time across all vehicles at that moment.
    pub fn merge(sector_count: usize, streams: Vec<Vec<SectorEvent>>) -> Self {
        let mut events: Vec<SectorEvent> = streams.into_iter().flatten().collect();
        // Stable, so each vehicle's own event order survives equal timestamps
        events.sort_by(|a, b| {
            a.time()
                .total_cmp(&b.time())
                .then_with(|| a.vehicle_id().cmp(b.vehicle_id()))
        });

        let mut leaderboard = SectorLeaderboard::new(sector_count);
        let mut by_vehicle: HashMap<VehicleId, Vec<usize>> = HashMap::new();
        for (position, event) in events.iter_mut().enumerate() {
            if let SectorEvent::SectorCompleted {
                vehicle_id,
                lap_number,
                sector_index,
                elapsed_s,
                delta_to_best_s,
                new_best,
                ..
            } = event
            {
                let (delta, best) =
                    leaderboard.record(*sector_index, *elapsed_s, vehicle_id, *lap_number);
                *delta_to_best_s = delta;
                *new_best = best;
            }
            by_vehicle
                .entry(event.vehicle_id().to_string())
                .or_default()
                .push(position);
        }
        Self {
            sector_count,
            events,
            by_vehicle,
        }
    }

    pub fn sector_count(&self) -> usize {
        self.sector_count
    }

    pub fn events(&self) -> &[SectorEvent] {
        &self.events
    }

    /// Session best per sector counting only completions up to `time`
    pub fn best_times_at(&self, time: f64) -> Vec<Option<SectorBest>> {
        let mut leaderboard = SectorLeaderboard::new(self.sector_count);
        for event in self.events.iter().take_while(|e| e.time() <= time) {
            if let SectorEvent::SectorCompleted {
                vehicle_id,
                lap_number,
                sector_index,
                elapsed_s,
                ..
            } = event
            {
                leaderboard.record(*sector_index, *elapsed_s, vehicle_id, *lap_number);
            }
        }
        leaderboard.best
    }

    /// Sector state of `vehicle_id` at `time`, `None` before its first sample
    pub fn snapshot(&self, vehicle_id: &str, time: f64) -> Option<SectorTimingSnapshot> {
        let positions = self.by_vehicle.get(vehicle_id)?;
        let seen = positions.partition_point(|p| self.events[*p].time() <= time);
        let vehicle_events = &positions[..seen];

        let (lap_number, current_sector, sector_entry_time) =
            vehicle_events.iter().rev().find_map(|p| match &self.events[*p] {
                SectorEvent::SectorEntered {
                    lap_number,
                    sector_index,
                    time,
                    ..
                } => Some((*lap_number, *sector_index, *time)),
                _ => None,
            })?;

        let mut completed_sector_times = Vec::new();
        let mut deltas_to_best_s = Vec::new();
        for p in vehicle_events {
            if let SectorEvent::SectorCompleted {
                lap_number: lap,
                elapsed_s,
                delta_to_best_s,
                ..
            } = &self.events[*p]
            {
                if *lap == lap_number {
                    completed_sector_times.push(*elapsed_s);
                    deltas_to_best_s.push(*delta_to_best_s);
                }
            }
        }

        Some(SectorTimingSnapshot {
            vehicle_id: vehicle_id.to_string(),
            time,
            lap_number,
            current_sector,
            sector_entry_time,
            elapsed_in_sector_s: time - sector_entry_time,
            completed_sector_times,
            deltas_to_best_s,
            best_times: self.best_times_at(time),
        })
    }
}
