// Lap segmentation of resampled trajectories

use std::f64::consts::FRAC_PI_2;
use std::ops::Range;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::ReferenceFilter;
use crate::telemetry::{TrajectoryRow, VehicleId, VehicleTrajectory};
use crate::track::geometry::{Point2D, wrap_angle};

/// Deviation from the line's travel direction still accepted as a forward crossing
pub const DIRECTION_TOLERANCE: f64 = FRAC_PI_2;

/// Below this speed (m/s) the travel direction is unreliable
const MIN_CROSSING_SPEED: f64 = 1.0;

/// A lap-distance drop must not recover within this many seconds to count as a reset
const RESET_CONFIRMATION_S: f64 = 1.0;

/// Start/finish line modelled as a point, a half-width and a travel direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartFinishLine {
    pub point: Point2D,
    /// Lateral half-width of the line, also the proximity radius when no direction is known
    pub radius_m: f64,
    /// Primary travel direction in radians (0 = east, counter-clockwise)
    pub direction: Option<f64>,
}

impl StartFinishLine {
    /// Whether moving from `prev` to `pos` crosses the line forwards
    pub fn crossed(&self, prev: &Point2D, pos: &Point2D) -> bool {
        let Some(direction) = self.direction else {
            // Without a direction fall back to entering the proximity radius
            let was_inside = prev.distance(&self.point) <= self.radius_m;
            let is_inside = pos.distance(&self.point) <= self.radius_m;
            return !was_inside && is_inside;
        };
        let (dx, dy) = (direction.cos(), direction.sin());
        let along = |p: &Point2D| (p.x - self.point.x) * dx + (p.y - self.point.y) * dy;
        let lateral = |p: &Point2D| -(p.x - self.point.x) * dy + (p.y - self.point.y) * dx;
        if !(along(prev) < 0.0 && along(pos) >= 0.0) {
            return false;
        }
        if lateral(pos).abs() > self.radius_m {
            return false;
        }
        let heading = prev.heading_to(pos);
        wrap_angle(heading - direction).abs() <= DIRECTION_TOLERANCE
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmenterConfig {
    /// A lap-distance drop larger than this starts a new lap
    pub reset_threshold_m: f64,
    /// Triggers within this many seconds of the previous boundary are ignored
    pub min_lap_duration_s: f64,
    /// A trajectory whose first lap distance is below this starts on the line
    pub start_line_tolerance_m: f64,
    pub start_finish: Option<StartFinishLine>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            reset_threshold_m: 100.0,
            min_lap_duration_s: 20.0,
            start_line_tolerance_m: 10.0,
            start_finish: None,
        }
    }
}

/// What opened a lap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LapTrigger {
    /// The trajectory started here
    RecordingStart,
    DistanceReset,
    StartFinish,
}

/// A lap as an index range into its vehicle's trajectory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapRecord {
    pub vehicle_id: VehicleId,
    pub lap_number: u32,
    /// First row of the lap
    pub start_index: usize,
    /// First row of the next lap, or the trajectory length for the last lap
    pub end_index: usize,
    pub start_time: f64,
    /// Start of the next lap, or the last sample for the final lap
    pub end_time: f64,
    /// Both ends of the lap lie on the line
    pub complete: bool,
    pub trigger: LapTrigger,
}

impl LapRecord {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn rows(&self) -> Range<usize> {
        self.start_index..self.end_index
    }

    /// Rows of the lap including the first row of the next lap, which closes the loop
    pub fn closed_rows(&self, trajectory_len: usize) -> Range<usize> {
        self.start_index..(self.end_index + 1).min(trajectory_len)
    }

    pub fn contains_time(&self, t: f64) -> bool {
        t >= self.start_time && t < self.end_time
    }
}

pub struct LapSegmenter {
    config: SegmenterConfig,
}

impl LapSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Split a trajectory into laps.
    ///
    /// A lap boundary is the first row where either the lap distance drops by
    /// more than the reset threshold or the vehicle crosses the start/finish
    /// line forwards. Once a boundary fires, any trigger within the minimum lap
    /// duration is ignored, so the slower of two triggers for the same crossing
    /// never opens a second lap. A distance drop that climbs back within
    /// [`RESET_CONFIRMATION_S`] is a logger glitch, not a reset. The segmenter
    /// is a pure function of the trajectory and its configuration.
    pub fn segment(&self, trajectory: &VehicleTrajectory) -> Vec<LapRecord> {
        let rows = &trajectory.rows;
        if rows.is_empty() {
            return Vec::new();
        }
        let distances = trajectory.lap_distance.as_deref();

        let mut boundaries: Vec<(usize, LapTrigger)> = vec![(0, LapTrigger::RecordingStart)];
        let mut last_boundary_time: Option<f64> = None;
        for i in 1..rows.len() {
            let trigger = distances
                .filter(|d| self.is_distance_reset(rows, d, i))
                .map(|_| LapTrigger::DistanceReset)
                .or_else(|| {
                    self.config
                        .start_finish
                        .filter(|line| {
                            rows[i].speed >= MIN_CROSSING_SPEED
                                && line.crossed(&rows[i - 1].position(), &rows[i].position())
                        })
                        .map(|_| LapTrigger::StartFinish)
                });
            let Some(trigger) = trigger else {
                continue;
            };
            if let Some(last) = last_boundary_time {
                if rows[i].t - last < self.config.min_lap_duration_s {
                    debug!(
                        "Ignoring {:?} trigger for {} at {:.2}s, {:.2}s after previous lap start",
                        trigger,
                        trajectory.vehicle_id,
                        rows[i].t,
                        rows[i].t - last
                    );
                    continue;
                }
            }
            last_boundary_time = Some(rows[i].t);
            boundaries.push((i, trigger));
        }

        let tolerance = self.config.start_line_tolerance_m;
        let starts_on_line = match distances.and_then(|d| start_distance(rows, d)) {
            Some(distance) => distance.abs() <= tolerance,
            None => self.config.start_finish.is_some_and(|line| {
                rows[0].position().distance(&line.point) <= tolerance
            }),
        };

        let mut laps = Vec::with_capacity(boundaries.len());
        for (lap_index, &(start_index, trigger)) in boundaries.iter().enumerate() {
            let next = boundaries.get(lap_index + 1).map(|b| b.0);
            let end_index = next.unwrap_or(rows.len());
            let end_time = match next {
                Some(index) => rows[index].t,
                None => rows[rows.len() - 1].t,
            };
            let opens_on_line = lap_index > 0 || starts_on_line;
            // Zero-length leading segment when the first row is itself a boundary
            if end_index == start_index {
                continue;
            }
            laps.push(LapRecord {
                vehicle_id: trajectory.vehicle_id.clone(),
                lap_number: laps.len() as u32 + 1,
                start_index,
                end_index,
                start_time: rows[start_index].t,
                end_time,
                complete: opens_on_line && next.is_some(),
                trigger,
            });
        }
        laps
    }

    fn is_distance_reset(
        &self,
        rows: &[TrajectoryRow],
        distances: &[Option<f64>],
        i: usize,
    ) -> bool {
        let (Some(before), Some(after)) = (distances[i - 1], distances[i]) else {
            return false;
        };
        let floor = before - self.config.reset_threshold_m;
        if after >= floor {
            return false;
        }
        let recovered = rows[i + 1..]
            .iter()
            .zip(&distances[i + 1..])
            .take_while(|(row, _)| row.t - rows[i].t <= RESET_CONFIRMATION_S)
            .any(|(_, d)| d.is_some_and(|d| d >= floor));
        if recovered {
            debug!("Ignoring lap distance glitch at {:.2}s", rows[i].t);
        }
        !recovered
    }
}

/// Lap distance at the first row, extrapolated back from the first logged sample
fn start_distance(rows: &[TrajectoryRow], distances: &[Option<f64>]) -> Option<f64> {
    let first = distances.iter().position(Option::is_some)?;
    let travelled: f64 = rows[..=first]
        .windows(2)
        .map(|pair| pair[0].speed * (pair[1].t - pair[0].t))
        .sum();
    distances[first].map(|d| d - travelled)
}

/// Fastest complete lap; ties go to the lowest vehicle id, then the lowest lap number
pub fn fastest_lap<'a>(laps: impl IntoIterator<Item = &'a LapRecord>) -> Option<&'a LapRecord> {
    laps.into_iter().filter(|lap| lap.complete).min_by(|a, b| {
        a.duration()
            .total_cmp(&b.duration())
            .then_with(|| a.vehicle_id.cmp(&b.vehicle_id))
            .then_with(|| a.lap_number.cmp(&b.lap_number))
    })
}

/// Complete laps fit to shape a reference line.
///
/// `fixes` are the vehicle's valid projected GPS fixes in time order and
/// `first_logger_lap` the time span of the logger's lap 1, when it was logged.
pub fn reference_laps(
    laps: &[LapRecord],
    fixes: &[(f64, Point2D)],
    first_logger_lap: Option<(f64, f64)>,
    filter: &ReferenceFilter,
) -> Vec<LapRecord> {
    laps.iter()
        .filter(|lap| lap.complete)
        .filter(|lap| {
            let fix_count = fixes.partition_point(|(t, _)| *t < lap.end_time)
                - fixes.partition_point(|(t, _)| *t < lap.start_time);
            let midpoint = 0.5 * (lap.start_time + lap.end_time);
            let out_lap = filter.skip_first_logger_lap
                && first_logger_lap.is_some_and(|(start, end)| (start..=end).contains(&midpoint));
            let too_short = filter
                .min_lap_time_s
                .is_some_and(|min| lap.duration() <= min);
            let keep = fix_count >= filter.min_gps_fixes && !out_lap && !too_short;
            if !keep {
                debug!(
                    "Lap {} of {} cannot shape a reference line: {} fixes, {:.2}s",
                    lap.lap_number,
                    lap.vehicle_id,
                    fix_count,
                    lap.duration()
                );
            }
            keep
        })
        .cloned()
        .collect()
}

/// Lap containing the trajectory row `index`
pub fn lap_for_index(laps: &[LapRecord], index: usize) -> Option<&LapRecord> {
    let position = laps.partition_point(|lap| lap.end_index <= index);
    laps.get(position).filter(|lap| lap.start_index <= index)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: f64 = 0.1;

    /// Circular track of `length` meters driven at `speed` m/s, starting `offset` meters past the line
    fn circuit(length: f64, speed: f64, duration: f64, offset: f64) -> VehicleTrajectory {
        let radius = length / std::f64::consts::TAU;
        let n = (duration / STEP).round() as usize;
        let mut rows = Vec::with_capacity(n);
        let mut distances = Vec::with_capacity(n);
        for i in 0..n {
            let t = i as f64 * STEP;
            let travelled = offset + speed * t;
            let lap_distance = travelled % length;
            // Counter-clockwise from the south-most point, heading east at the line
            let angle = lap_distance / radius - FRAC_PI_2;
            rows.push(TrajectoryRow {
                t,
                x: radius * angle.cos(),
                y: radius + radius * angle.sin(),
                speed,
                ..Default::default()
            });
            distances.push(Some(lap_distance));
        }
        VehicleTrajectory {
            vehicle_id: "GR86-022".to_string(),
            step_s: STEP,
            rows,
            lap_distance: Some(distances),
            ..Default::default()
        }
    }

    fn line() -> StartFinishLine {
        StartFinishLine {
            point: Point2D::new(0.0, 0.0),
            radius_m: 15.0,
            direction: Some(0.0),
        }
    }

    #[test]
    fn test_distance_reset_splits_laps() {
        let traj = circuit(1200.0, 30.0, 130.0, 0.0);
        let laps = LapSegmenter::new(SegmenterConfig::default()).segment(&traj);
        assert_eq!(laps.len(), 4);
        assert!(laps[0].complete);
        assert!(laps[1].complete);
        assert!(laps[2].complete);
        assert!(!laps[3].complete);
        for lap in &laps[..3] {
            assert!((lap.duration() - 40.0).abs() < 0.11);
        }
        assert_eq!(laps[1].trigger, LapTrigger::DistanceReset);
    }

    #[test]
    fn test_laps_tile_the_trajectory() {
        let traj = circuit(1200.0, 30.0, 130.0, 300.0);
        let laps = LapSegmenter::new(SegmenterConfig::default()).segment(&traj);
        assert_eq!(laps[0].start_index, 0);
        assert_eq!(laps.last().unwrap().end_index, traj.len());
        for pair in laps.windows(2) {
            assert_eq!(pair[0].end_index, pair[1].start_index);
            assert_eq!(pair[0].end_time, pair[1].start_time);
            assert!(pair[0].lap_number < pair[1].lap_number);
        }
        // Recording started mid-lap
        assert!(!laps[0].complete);
    }

    #[test]
    fn test_segmentation_is_idempotent() {
        let traj = circuit(1500.0, 42.0, 200.0, 700.0);
        let segmenter = LapSegmenter::new(SegmenterConfig {
            start_finish: Some(line()),
            ..Default::default()
        });
        assert_eq!(segmenter.segment(&traj), segmenter.segment(&traj));
    }

    #[test]
    fn test_noise_reset_is_filtered() {
        let mut traj = circuit(1200.0, 30.0, 100.0, 0.0);
        // A single glitch sample 5 seconds into the second lap
        let glitch = traj.index_at(45.0);
        if let Some(distances) = traj.lap_distance.as_mut() {
            distances[glitch] = Some(0.0);
        }
        let laps = LapSegmenter::new(SegmenterConfig::default()).segment(&traj);
        assert_eq!(laps.len(), 3);
        assert!((laps[1].duration() - 40.0).abs() < 0.11);
    }

    #[test]
    fn test_glitch_late_in_lap_is_not_a_reset() {
        let mut traj = circuit(1200.0, 30.0, 100.0, 0.0);
        // Past the minimum lap duration, then ramping back as interpolation would
        let glitch = traj.index_at(65.0);
        if let Some(distances) = traj.lap_distance.as_mut() {
            distances[glitch] = Some(0.0);
            distances[glitch + 1] = Some(380.0);
        }
        let laps = LapSegmenter::new(SegmenterConfig::default()).segment(&traj);
        assert_eq!(laps.len(), 3);
        assert!((laps[1].duration() - 40.0).abs() < 0.11);
        assert!((laps[2].start_time - 80.0).abs() < 0.11);
    }

    #[test]
    fn test_late_lap_distance_does_not_fake_a_line_start() {
        // Recording starts 700m into the lap, lap distance arrives 2 seconds later
        let mut traj = circuit(1200.0, 30.0, 90.0, 700.0);
        if let Some(distances) = traj.lap_distance.as_mut() {
            for d in distances.iter_mut().take(20) {
                *d = None;
            }
        }
        let laps = LapSegmenter::new(SegmenterConfig::default()).segment(&traj);
        assert!(!laps[0].complete);
        assert!((laps[0].duration() - 500.0 / 30.0).abs() < 0.11);
        assert!(laps[1].complete);
        assert!((laps[1].duration() - 40.0).abs() < 0.11);
        assert!(fastest_lap(&laps).is_some_and(|lap| lap.lap_number == 2));
    }

    #[test]
    fn test_late_lap_distance_from_the_line_still_starts_on_line() {
        let mut traj = circuit(1200.0, 30.0, 90.0, 0.0);
        if let Some(distances) = traj.lap_distance.as_mut() {
            distances[0] = None;
            distances[1] = None;
        }
        let laps = LapSegmenter::new(SegmenterConfig::default()).segment(&traj);
        assert!(laps[0].complete);
    }

    #[test]
    fn test_start_finish_proximity_without_lap_distance() {
        let mut traj = circuit(1200.0, 30.0, 130.0, 0.0);
        traj.lap_distance = None;
        let segmenter = LapSegmenter::new(SegmenterConfig {
            start_finish: Some(line()),
            ..Default::default()
        });
        let laps = segmenter.segment(&traj);
        assert_eq!(laps.len(), 4);
        assert!(laps[0].complete);
        assert_eq!(laps[1].trigger, LapTrigger::StartFinish);
        assert!((laps[1].duration() - 40.0).abs() < 0.11);
    }

    #[test]
    fn test_wrong_direction_does_not_trigger() {
        let line = StartFinishLine {
            direction: Some(std::f64::consts::PI),
            ..line()
        };
        assert!(!line.crossed(&Point2D::new(-1.0, 0.0), &Point2D::new(1.0, 0.0)));
        assert!(line.crossed(&Point2D::new(1.0, 0.0), &Point2D::new(-1.0, 0.0)));
        // Crossing far off to the side of the line
        assert!(!line.crossed(&Point2D::new(1.0, 50.0), &Point2D::new(-1.0, 50.0)));
    }

    #[test]
    fn test_first_trigger_wins() {
        let traj = circuit(1200.0, 30.0, 130.0, 0.0);
        let segmenter = LapSegmenter::new(SegmenterConfig {
            start_finish: Some(line()),
            ..Default::default()
        });
        let laps = segmenter.segment(&traj);
        // Both triggers fire on the same row; one lap per crossing
        assert_eq!(laps.len(), 4);
    }

    #[test]
    fn test_fastest_lap_tie_break() {
        let lap = |vehicle: &str, number: u32, duration: f64, complete: bool| LapRecord {
            vehicle_id: vehicle.to_string(),
            lap_number: number,
            start_index: 0,
            end_index: 10,
            start_time: 100.0,
            end_time: 100.0 + duration,
            complete,
            trigger: LapTrigger::DistanceReset,
        };
        let laps = vec![
            lap("GR86-010", 3, 95.0, true),
            lap("GR86-004", 5, 95.0, true),
            lap("GR86-004", 2, 95.0, true),
            lap("GR86-002", 9, 80.0, false),
        ];
        let best = fastest_lap(&laps).unwrap();
        assert_eq!(best.vehicle_id, "GR86-004");
        assert_eq!(best.lap_number, 2);
        assert!(fastest_lap(&laps[3..]).is_none());
    }

    #[test]
    fn test_reference_laps_filter() {
        let traj = circuit(1200.0, 30.0, 130.0, 0.0);
        let laps = LapSegmenter::new(SegmenterConfig::default()).segment(&traj);
        // One fix per second, none during the third lap
        let fixes: Vec<(f64, Point2D)> = (0..130)
            .filter(|t| !(80..120).contains(t))
            .map(|t| (t as f64, Point2D::new(0.0, 0.0)))
            .collect();
        let filter = ReferenceFilter {
            min_gps_fixes: 30,
            ..Default::default()
        };

        let kept = reference_laps(&laps, &fixes, Some((0.0, 39.9)), &filter);
        assert_eq!(kept.iter().map(|l| l.lap_number).collect::<Vec<_>>(), vec![1, 2]);

        let skip_out_lap = ReferenceFilter {
            skip_first_logger_lap: true,
            ..filter.clone()
        };
        let kept = reference_laps(&laps, &fixes, Some((0.0, 39.9)), &skip_out_lap);
        assert_eq!(kept.iter().map(|l| l.lap_number).collect::<Vec<_>>(), vec![2]);
        // Without a logged lap 1 nothing is an out lap
        assert_eq!(reference_laps(&laps, &fixes, None, &skip_out_lap).len(), 2);

        let floor = ReferenceFilter {
            min_lap_time_s: Some(40.5),
            ..filter
        };
        assert!(reference_laps(&laps, &fixes, None, &floor).is_empty());
    }

    #[test]
    fn test_lap_for_index() {
        let traj = circuit(1200.0, 30.0, 130.0, 0.0);
        let laps = LapSegmenter::new(SegmenterConfig::default()).segment(&traj);
        let index = traj.index_at(50.0);
        assert_eq!(lap_for_index(&laps, index).unwrap().lap_number, 2);
        assert!(lap_for_index(&laps, traj.len()).is_none());
    }
}
