// Read-only queries a replay renderer makes against a processed session

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::analysis::{DeltaTrailGenerator, DeltaTrailSegment, TrailWindow};
use crate::config::{MAX_TRAIL_WINDOW_S, MIN_TRAIL_WINDOW_S};
use crate::errors::LaptraceError;
use crate::laps::LapRecord;
use crate::pipeline::{SessionArtifacts, SessionMetadata, VehicleRun};
use crate::telemetry::{TrajectoryRow, VehicleId};
use crate::track::{RacingLineKind, SectorTimingSnapshot, TrackReference};

/// Trails kept before the oldest cached one is evicted
pub const DEFAULT_TRAIL_CACHE_CAPACITY: usize = 256;

/// Reference a trail is compared against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrailReference {
    Line(RacingLineKind),
    /// The queried vehicle's own per-car line
    OwnLine,
}

impl From<RacingLineKind> for TrailReference {
    fn from(kind: RacingLineKind) -> Self {
        Self::Line(kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrailQuery {
    pub reference: TrailReference,
    pub window_s: f64,
    /// Current playback time, end of the window
    pub at_time: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TrailKey {
    vehicle_id: VehicleId,
    reference: RacingLineKind,
    window_ms: u64,
    /// Last trajectory row at or before the playback time, `None` before the first row
    end_row: Option<usize>,
}

#[derive(Default)]
struct TrailCache {
    entries: HashMap<TrailKey, Arc<Vec<DeltaTrailSegment>>>,
    order: VecDeque<TrailKey>,
}

/// A processed session ready for replay.
///
/// Every query takes `&self`; the only interior state is the trail cache.
pub struct ReplaySession {
    artifacts: SessionArtifacts,
    cache: Mutex<TrailCache>,
    cache_capacity: usize,
}

impl ReplaySession {
    pub fn new(artifacts: SessionArtifacts) -> Self {
        Self::with_cache_capacity(artifacts, DEFAULT_TRAIL_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(artifacts: SessionArtifacts, cache_capacity: usize) -> Self {
        Self {
            artifacts,
            cache: Mutex::new(TrailCache::default()),
            cache_capacity: cache_capacity.max(1),
        }
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.artifacts.metadata
    }

    pub fn artifacts(&self) -> &SessionArtifacts {
        &self.artifacts
    }

    pub fn vehicle_ids(&self) -> impl Iterator<Item = &VehicleId> {
        self.artifacts.vehicles.keys()
    }

    fn vehicle(&self, vehicle_id: &str) -> Result<&VehicleRun, LaptraceError> {
        self.artifacts
            .vehicles
            .get(vehicle_id)
            .ok_or_else(|| LaptraceError::UnknownVehicle {
                vehicle_id: vehicle_id.to_string(),
            })
    }

    pub fn laps(&self, vehicle_id: &str) -> Result<&[LapRecord], LaptraceError> {
        Ok(&self.vehicle(vehicle_id)?.laps)
    }

    pub fn racing_line(&self, kind: &RacingLineKind) -> Option<&TrackReference> {
        self.artifacts.references.get(kind)
    }

    /// Trajectory rows with `t0 <= t <= t1`
    pub fn trajectory_slice(
        &self,
        vehicle_id: &str,
        t0: f64,
        t1: f64,
    ) -> Result<&[TrajectoryRow], LaptraceError> {
        Ok(self.vehicle(vehicle_id)?.trajectory.slice(t0, t1))
    }

    /// Delta-speed trail ending at the query time, served from the cache when possible
    pub fn delta_trail(
        &self,
        vehicle_id: &str,
        query: &TrailQuery,
    ) -> Result<Arc<Vec<DeltaTrailSegment>>, LaptraceError> {
        let run = self.vehicle(vehicle_id)?;
        if !(MIN_TRAIL_WINDOW_S..=MAX_TRAIL_WINDOW_S).contains(&query.window_s) {
            return Err(LaptraceError::InvalidConfig {
                field: "window_s".to_string(),
                reason: format!(
                    "must be between {MIN_TRAIL_WINDOW_S} and {MAX_TRAIL_WINDOW_S} seconds"
                ),
            });
        }
        let kind = match &query.reference {
            TrailReference::Line(kind) => kind.clone(),
            TrailReference::OwnLine => RacingLineKind::PerCar(vehicle_id.to_string()),
        };
        let reference =
            self.racing_line(&kind)
                .ok_or_else(|| LaptraceError::ReferenceUnavailable {
                    reference: kind.to_string(),
                })?;

        let trajectory = &run.trajectory;
        let end_row = (!trajectory.is_empty() && query.at_time >= trajectory.start_time())
            .then(|| trajectory.index_at(query.at_time));
        // Cached per millisecond of window, so the trail is built from the rounded window too
        let window_ms = (query.window_s * 1000.0).round() as u64;
        let key = TrailKey {
            vehicle_id: vehicle_id.to_string(),
            reference: kind,
            window_ms,
            end_row,
        };
        if let Some(trail) = self.cached(&key) {
            trace!("Trail cache hit for {} at {:.2}s", vehicle_id, query.at_time);
            return Ok(trail);
        }

        let trail = match end_row {
            Some(row) => DeltaTrailGenerator::new(reference).generate(
                trajectory,
                &run.laps,
                TrailWindow {
                    end_time: trajectory.rows[row].t,
                    duration_s: window_ms as f64 / 1000.0,
                },
            ),
            None => Vec::new(),
        };
        let trail = Arc::new(trail);
        self.store(key, trail.clone());
        Ok(trail)
    }

    /// Sector state of a vehicle at playback time `t`; `None` before its first sample
    pub fn sector_state(
        &self,
        vehicle_id: &str,
        t: f64,
    ) -> Result<Option<SectorTimingSnapshot>, LaptraceError> {
        self.vehicle(vehicle_id)?;
        let timeline = self
            .artifacts
            .sector_timeline
            .as_ref()
            .ok_or(LaptraceError::MissingSectorMap)?;
        Ok(timeline.snapshot(vehicle_id, t))
    }

    pub fn cached_trails(&self) -> usize {
        self.cache
            .lock()
            .map(|cache| cache.entries.len())
            .unwrap_or(0)
    }

    fn cached(&self, key: &TrailKey) -> Option<Arc<Vec<DeltaTrailSegment>>> {
        let cache = self.cache.lock().ok()?;
        cache.entries.get(key).cloned()
    }

    fn store(&self, key: TrailKey, trail: Arc<Vec<DeltaTrailSegment>>) {
        // A poisoned cache only costs recomputation
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        if cache.entries.contains_key(&key) {
            return;
        }
        while cache.entries.len() >= self.cache_capacity {
            let Some(oldest) = cache.order.pop_front() else {
                break;
            };
            cache.entries.remove(&oldest);
            debug!("Evicted cached trail for {}", oldest.vehicle_id);
        }
        cache.order.push_back(key.clone());
        cache.entries.insert(key, trail);
    }
}
