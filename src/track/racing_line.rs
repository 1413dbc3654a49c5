// Racing line construction and the reference speed profile along it

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use simple_moving_average::{SMA, SumTreeSMA};

use crate::errors::LaptraceError;
use crate::laps::{LapRecord, fastest_lap};
use crate::telemetry::{VehicleId, VehicleTrajectory};

use super::geometry::{Point2D, menger_curvature};

pub const DEFAULT_SMOOTHING_WINDOW: usize = 9;
/// Chord length over which curvature is measured
const CURVATURE_CHORD_M: f64 = 10.0;
const IDEAL_SPEED_CURVATURE_WEIGHT: f64 = 0.55;
/// Floor of the ideal speed profile in m/s
const MIN_IDEAL_SPEED_MS: f64 = 15.0;
/// Consecutive samples closer than this are the same point
const DUPLICATE_POINT_M: f64 = 1e-6;

/// A specific lap of a specific vehicle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LapRef {
    pub vehicle_id: VehicleId,
    pub lap_number: u32,
}

impl From<&LapRecord> for LapRef {
    fn from(lap: &LapRecord) -> Self {
        Self {
            vehicle_id: lap.vehicle_id.clone(),
            lap_number: lap.lap_number,
        }
    }
}

/// Which reference a racing line stands for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RacingLineKind {
    /// Consensus of every vehicle's best lap
    Canonical,
    /// The single fastest complete lap of the session
    GlobalBest,
    /// One vehicle's own fastest complete lap
    PerCar(VehicleId),
}

impl fmt::Display for RacingLineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canonical => write!(f, "canonical"),
            Self::GlobalBest => write!(f, "global-best"),
            Self::PerCar(vehicle_id) => write!(f, "per-car:{vehicle_id}"),
        }
    }
}

/// Where a racing line's geometry and speeds came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LineSource {
    Lap { lap: LapRef, lap_time_s: f64 },
    Consensus { laps: Vec<LapRef> },
}

/// Reference speed as a function of arc length along a closed line
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpeedProfile {
    arc_lengths: Vec<f64>,
    speeds: Vec<f64>,
    track_length: f64,
}

impl SpeedProfile {
    pub fn new(arc_lengths: Vec<f64>, speeds: Vec<f64>, track_length: f64) -> Self {
        Self {
            arc_lengths,
            speeds,
            track_length,
        }
    }

    pub fn speeds(&self) -> &[f64] {
        &self.speeds
    }

    /// Speed at arc length `s`, linearly interpolated and wrapping at the track length
    pub fn speed_at(&self, s: f64) -> f64 {
        let n = self.speeds.len();
        if n == 0 {
            return 0.0;
        }
        if n == 1 || self.track_length <= 0.0 {
            return self.speeds[0];
        }
        let s = s.rem_euclid(self.track_length);
        let index = self.arc_lengths.partition_point(|a| *a <= s).saturating_sub(1);
        let next = (index + 1) % n;
        let s0 = self.arc_lengths[index];
        let s1 = if next == 0 {
            self.track_length
        } else {
            self.arc_lengths[next]
        };
        if s1 <= s0 {
            return self.speeds[index];
        }
        let fraction = ((s - s0) / (s1 - s0)).clamp(0.0, 1.0);
        self.speeds[index] + (self.speeds[next] - self.speeds[index]) * fraction
    }
}

/// A closed loop of near-uniformly spaced points in travel direction.
/// The successor of the last point is the first.
#[derive(Debug, Clone, PartialEq)]
pub struct RacingLine {
    pub kind: RacingLineKind,
    pub source: LineSource,
    pub points: Vec<Point2D>,
    /// Arc length at each point, starting at 0
    pub arc_lengths: Vec<f64>,
    /// Loop length including the closing segment
    pub track_length: f64,
    /// Signed curvature (1/m) at each point
    pub curvature: Vec<f64>,
    pub speed_profile: SpeedProfile,
}

impl RacingLine {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn successor(&self, index: usize) -> usize {
        (index + 1) % self.points.len()
    }

    pub fn predecessor(&self, index: usize) -> usize {
        (index + self.points.len() - 1) % self.points.len()
    }

    /// Arc length of the closest location to `query` on the two segments around point `index`
    pub fn refine_arc_length(&self, index: usize, query: &Point2D) -> f64 {
        let n = self.points.len();
        if n < 2 {
            return 0.0;
        }
        let point = self.points[index];
        let mut best = (point.distance_squared(query), self.arc_lengths[index]);
        for (from, to) in [(self.predecessor(index), index), (index, self.successor(index))] {
            let (a, b) = (self.points[from], self.points[to]);
            let segment = a.distance_squared(&b);
            if segment <= 0.0 {
                continue;
            }
            let fraction = (((query.x - a.x) * (b.x - a.x) + (query.y - a.y) * (b.y - a.y))
                / segment)
                .clamp(0.0, 1.0);
            let projected = a.lerp(&b, fraction);
            let distance = projected.distance_squared(query);
            if distance < best.0 {
                let end = if to == 0 {
                    self.track_length
                } else {
                    self.arc_lengths[to]
                };
                let start = self.arc_lengths[from];
                best = (distance, start + (end - start) * fraction);
            }
        }
        best.1.rem_euclid(self.track_length.max(f64::MIN_POSITIVE))
    }

    /// Reference speed bounded by a curvature penalty
    pub fn ideal_speeds(&self) -> Vec<f64> {
        let max_curvature = self
            .curvature
            .iter()
            .map(|k| k.abs())
            .fold(0.0f64, f64::max);
        self.speed_profile
            .speeds()
            .iter()
            .zip(&self.curvature)
            .map(|(speed, k)| {
                let scaled = if max_curvature > 0.0 {
                    k.abs() / max_curvature
                } else {
                    0.0
                };
                (speed * (1.0 - IDEAL_SPEED_CURVATURE_WEIGHT * scaled)).max(MIN_IDEAL_SPEED_MS)
            })
            .collect()
    }

    /// Time to drive the loop at the ideal speeds
    pub fn ideal_lap_time(&self) -> f64 {
        let speeds = self.ideal_speeds();
        let n = self.points.len();
        (0..n)
            .map(|i| {
                let next = self.successor(i);
                let ds = self.points[i].distance(&self.points[next]);
                let v = 0.5 * (speeds[i] + speeds[next]);
                if v > 0.0 { ds / v } else { 0.0 }
            })
            .sum()
    }
}

/// A vehicle's trajectory together with its laps
#[derive(Debug, Clone, Copy)]
pub struct LapSource<'a> {
    pub trajectory: &'a VehicleTrajectory,
    pub laps: &'a [LapRecord],
}

/// Builds racing lines with a centred moving average of `SMOOTHING_WINDOW` points
pub struct RacingLineBuilder<const SMOOTHING_WINDOW: usize = DEFAULT_SMOOTHING_WINDOW> {
    point_count: usize,
}

impl RacingLineBuilder {
    pub fn new(point_count: usize) -> Self {
        Self { point_count }
    }
}

impl<const SMOOTHING_WINDOW: usize> RacingLineBuilder<SMOOTHING_WINDOW> {
    pub fn with_window(point_count: usize) -> Self {
        Self { point_count }
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }

    /// Line from the fastest complete lap across all vehicles
    pub fn build_global_best(&self, sources: &[LapSource]) -> Result<RacingLine, LaptraceError> {
        let best = fastest_lap(sources.iter().flat_map(|s| s.laps.iter()))
            .ok_or(LaptraceError::NoCompleteLap)?;
        let source = sources
            .iter()
            .find(|s| s.trajectory.vehicle_id == best.vehicle_id)
            .ok_or(LaptraceError::NoCompleteLap)?;
        info!(
            "Global best lap is {} lap {} in {:.3}s",
            best.vehicle_id,
            best.lap_number,
            best.duration()
        );
        self.build_from_lap(RacingLineKind::GlobalBest, source.trajectory, best)
    }

    /// Line from one vehicle's own fastest complete lap
    pub fn build_per_car(&self, source: LapSource) -> Result<RacingLine, LaptraceError> {
        let best = fastest_lap(source.laps).ok_or(LaptraceError::NoCompleteLap)?;
        self.build_from_lap(
            RacingLineKind::PerCar(source.trajectory.vehicle_id.clone()),
            source.trajectory,
            best,
        )
    }

    /// Point-wise median of several lines, each aligned by arc-length fraction from its start
    pub fn build_canonical(&self, lines: &[RacingLine]) -> Result<RacingLine, LaptraceError> {
        if lines.is_empty() {
            return Err(LaptraceError::NoCompleteLap);
        }
        let n = self.point_count;
        let aligned: Vec<(Vec<Point2D>, Vec<f64>)> = lines
            .iter()
            .map(|line| {
                let mut points = line.points.clone();
                let mut speeds = line.speed_profile.speeds().to_vec();
                // Close the loop so resampling covers the final segment
                points.push(line.points[0]);
                speeds.push(speeds[0]);
                resample_by_arc_length(&points, &speeds, n)
            })
            .collect();

        let median = |values: Vec<f64>| -> f64 {
            let sorted = values.into_iter().sorted_by(f64::total_cmp).collect_vec();
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 0 {
                0.5 * (sorted[mid - 1] + sorted[mid])
            } else {
                sorted[mid]
            }
        };
        let mut points = Vec::with_capacity(n);
        let mut speeds = Vec::with_capacity(n);
        for j in 0..n {
            let x = median(aligned.iter().map(|(p, _)| p[j].x).collect());
            let y = median(aligned.iter().map(|(p, _)| p[j].y).collect());
            points.push(Point2D::new(x, y));
            speeds.push(median(aligned.iter().map(|(_, s)| s[j]).collect()));
        }
        points.push(points[0]);
        speeds.push(speeds[0]);
        let (points, speeds) = resample_by_arc_length(&points, &speeds, n);

        let laps = lines
            .iter()
            .flat_map(|line| match &line.source {
                LineSource::Lap { lap, .. } => vec![lap.clone()],
                LineSource::Consensus { laps } => laps.clone(),
            })
            .sorted()
            .dedup()
            .collect();
        info!("Built canonical line from {} racing lines", lines.len());
        Ok(self.finish(
            RacingLineKind::Canonical,
            LineSource::Consensus { laps },
            points,
            speeds,
        ))
    }

    /// Resample one lap by arc length and smooth it
    pub fn build_from_lap(
        &self,
        kind: RacingLineKind,
        trajectory: &VehicleTrajectory,
        lap: &LapRecord,
    ) -> Result<RacingLine, LaptraceError> {
        let rows = &trajectory.rows[lap.closed_rows(trajectory.len())];
        let mut points: Vec<Point2D> = Vec::with_capacity(rows.len());
        let mut speeds = Vec::with_capacity(rows.len());
        for row in rows {
            let point = row.position();
            if points
                .last()
                .is_some_and(|last| last.distance(&point) < DUPLICATE_POINT_M)
            {
                continue;
            }
            points.push(point);
            speeds.push(row.speed);
        }
        if points.len() < 3 {
            return Err(LaptraceError::NoCompleteLap);
        }
        let (points, speeds) = resample_by_arc_length(&points, &speeds, self.point_count);
        debug!(
            "Resampled {} lap {} into {} points",
            lap.vehicle_id,
            lap.lap_number,
            points.len()
        );
        Ok(self.finish(
            kind,
            LineSource::Lap {
                lap: LapRef::from(lap),
                lap_time_s: lap.duration(),
            },
            points,
            speeds,
        ))
    }

    fn finish(
        &self,
        kind: RacingLineKind,
        source: LineSource,
        points: Vec<Point2D>,
        speeds: Vec<f64>,
    ) -> RacingLine {
        let xs = smooth_closed::<SMOOTHING_WINDOW>(&points.iter().map(|p| p.x).collect_vec());
        let ys = smooth_closed::<SMOOTHING_WINDOW>(&points.iter().map(|p| p.y).collect_vec());
        let points = xs
            .into_iter()
            .zip(ys)
            .map(|(x, y)| Point2D::new(x, y))
            .collect_vec();

        let n = points.len();
        let mut arc_lengths = Vec::with_capacity(n);
        let mut travelled = 0.0;
        for i in 0..n {
            if i > 0 {
                travelled += points[i - 1].distance(&points[i]);
            }
            arc_lengths.push(travelled);
        }
        let track_length = travelled + points[n - 1].distance(&points[0]);
        let curvature = closed_curvature(&points, track_length);

        RacingLine {
            kind,
            source,
            speed_profile: SpeedProfile::new(arc_lengths.clone(), speeds, track_length),
            points,
            arc_lengths,
            track_length,
            curvature,
        }
    }
}

/// Sample an open polyline at `count` evenly spaced arc lengths in `[0, length)`
fn resample_by_arc_length(
    points: &[Point2D],
    values: &[f64],
    count: usize,
) -> (Vec<Point2D>, Vec<f64>) {
    let mut cumulative = Vec::with_capacity(points.len());
    let mut travelled = 0.0;
    cumulative.push(0.0);
    for pair in points.windows(2) {
        travelled += pair[0].distance(&pair[1]);
        cumulative.push(travelled);
    }

    let spacing = travelled / count as f64;
    let mut out_points = Vec::with_capacity(count);
    let mut out_values = Vec::with_capacity(count);
    let mut segment = 0;
    for j in 0..count {
        let s = j as f64 * spacing;
        while segment + 2 < cumulative.len() && cumulative[segment + 1] <= s {
            segment += 1;
        }
        let (s0, s1) = (cumulative[segment], cumulative[segment + 1]);
        let fraction = if s1 > s0 {
            ((s - s0) / (s1 - s0)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        out_points.push(points[segment].lerp(&points[segment + 1], fraction));
        out_values.push(values[segment] + (values[segment + 1] - values[segment]) * fraction);
    }
    (out_points, out_values)
}

/// Centred moving average over a closed sequence
fn smooth_closed<const WINDOW: usize>(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if WINDOW < 2 || n < WINDOW {
        return values.to_vec();
    }
    let half = WINDOW / 2;
    let mut sma = SumTreeSMA::<f64, f64, WINDOW>::new();
    let mut smoothed = vec![0.0; n];
    for k in 0..(n + WINDOW - 1) {
        sma.add_sample(values[(k + n - half) % n]);
        if k + 1 >= WINDOW {
            smoothed[k + 1 - WINDOW] = sma.get_average();
        }
    }
    smoothed
}

fn closed_curvature(points: &[Point2D], track_length: f64) -> Vec<f64> {
    let n = points.len();
    if n < 3 {
        return vec![0.0; n];
    }
    let spacing = track_length / n as f64;
    let stride = if spacing > 0.0 {
        ((CURVATURE_CHORD_M / spacing).round() as usize).clamp(1, (n - 1) / 2)
    } else {
        1
    };
    (0..n)
        .map(|i| {
            menger_curvature(
                &points[(i + n - stride) % n],
                &points[i],
                &points[(i + stride) % n],
            )
        })
        .collect()
}

/// Vehicles whose median lap time has a z-score beyond `z_threshold` across the field.
///
/// Uses the sample standard deviation; a field of fewer than two vehicles or
/// with identical times has no outliers.
pub fn outlier_vehicles(
    median_lap_times: &BTreeMap<VehicleId, f64>,
    z_threshold: f64,
) -> BTreeSet<VehicleId> {
    let n = median_lap_times.len();
    if n < 2 {
        return BTreeSet::new();
    }
    let mean = median_lap_times.values().sum::<f64>() / n as f64;
    let variance = median_lap_times
        .values()
        .map(|t| (t - mean).powi(2))
        .sum::<f64>()
        / (n - 1) as f64;
    let sigma = variance.sqrt();
    if !(sigma > 0.0) {
        return BTreeSet::new();
    }
    median_lap_times
        .iter()
        .filter(|(vehicle_id, t)| {
            let z = (**t - mean) / sigma;
            let outlier = z.abs() > z_threshold;
            if outlier {
                debug!("Vehicle {vehicle_id} lap times are an outlier, z = {z:.2}");
            }
            outlier
        })
        .map(|(vehicle_id, _)| vehicle_id.clone())
        .collect()
}
