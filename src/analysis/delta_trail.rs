// Delta-speed trails against a reference racing line

use log::trace;
use serde::{Deserialize, Serialize};

use crate::laps::{LapRecord, lap_for_index};
use crate::telemetry::{VehicleId, VehicleTrajectory};
use crate::track::TrackReference;

/// One sample of a trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaTrailSegment {
    pub vehicle_id: VehicleId,
    /// Session time of the sample
    pub timestamp: f64,
    /// Seconds since the start of the lap the trail belongs to
    pub t_rel: f64,
    pub x: f64,
    pub y: f64,
    /// Sample speed minus reference speed, m/s
    pub delta_speed: f64,
    /// Direction of travel in radians
    pub heading: f64,
    /// Reference line curvature at the matched position
    pub curvature: f64,
    /// Matched arc length along the reference line
    pub arc_length: f64,
}

/// Trailing window ending at `end_time`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailWindow {
    pub end_time: f64,
    pub duration_s: f64,
}

pub struct DeltaTrailGenerator<'a> {
    reference: &'a TrackReference,
}

impl<'a> DeltaTrailGenerator<'a> {
    pub fn new(reference: &'a TrackReference) -> Self {
        Self { reference }
    }

    /// Trail of `trajectory` over `window`, oldest sample first.
    ///
    /// The window never reaches before the first recorded sample or back into
    /// the previous lap; it is cut short instead.
    pub fn generate(
        &self,
        trajectory: &VehicleTrajectory,
        laps: &[LapRecord],
        window: TrailWindow,
    ) -> Vec<DeltaTrailSegment> {
        if trajectory.is_empty() || window.end_time < trajectory.start_time() {
            return Vec::new();
        }
        let end_index = trajectory.index_at(window.end_time);
        let lap_start = lap_for_index(laps, end_index)
            .map(|lap| lap.start_time)
            .unwrap_or_else(|| trajectory.start_time());
        let window_start = (window.end_time - window.duration_s)
            .max(lap_start)
            .max(trajectory.start_time());

        let all_rows = &trajectory.rows;
        let first = all_rows.partition_point(|row| row.t < window_start);
        let last = all_rows.partition_point(|row| row.t <= window.end_time);
        let line = &self.reference.line;

        let mut segments = Vec::with_capacity(last.saturating_sub(first));
        for index in first..last {
            let row = &all_rows[index];
            let position = row.position();
            let Some(located) = self.reference.locate(&position) else {
                continue;
            };
            let heading = if index > 0 {
                all_rows[index - 1].position().heading_to(&position)
            } else if index + 1 < all_rows.len() {
                position.heading_to(&all_rows[index + 1].position())
            } else {
                0.0
            };
            let reference_speed = line.speed_profile.speed_at(located.arc_length);
            segments.push(DeltaTrailSegment {
                vehicle_id: trajectory.vehicle_id.clone(),
                timestamp: row.t,
                t_rel: row.t - lap_start,
                x: row.x,
                y: row.y,
                delta_speed: row.speed - reference_speed,
                heading,
                curvature: line.curvature[located.nearest.index],
                arc_length: located.arc_length,
            });
        }
        trace!(
            "Trail for {} against {} has {} samples",
            trajectory.vehicle_id,
            line.kind,
            segments.len()
        );
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::laps::LapTrigger;
    use crate::telemetry::TrajectoryRow;
    use crate::track::{LineSource, RacingLine, RacingLineKind, SpeedProfile};
    use crate::track::geometry::Point2D;
    use std::f64::consts::TAU;

    const RADIUS: f64 = 100.0;

    fn reference(reference_speed: f64) -> TrackReference {
        let n = 720;
        let points: Vec<Point2D> = (0..n)
            .map(|i| {
                let angle = TAU * i as f64 / n as f64;
                Point2D::new(RADIUS * angle.cos(), RADIUS * angle.sin())
            })
            .collect();
        let spacing = points[0].distance(&points[1]);
        let arc_lengths: Vec<f64> = (0..n).map(|i| i as f64 * spacing).collect();
        let track_length = spacing * n as f64;
        TrackReference::new(RacingLine {
            kind: RacingLineKind::Canonical,
            source: LineSource::Consensus { laps: Vec::new() },
            speed_profile: SpeedProfile::new(
                arc_lengths.clone(),
                vec![reference_speed; n],
                track_length,
            ),
            points,
            arc_lengths,
            track_length,
            curvature: vec![1.0 / RADIUS; n],
        })
    }

    /// 10 Hz trajectory around the reference circle at constant speed
    fn trajectory(speed: f64, start: f64, duration: f64) -> VehicleTrajectory {
        let n = (duration * 10.0).round() as usize;
        VehicleTrajectory {
            vehicle_id: "GR86-040".to_string(),
            step_s: 0.1,
            rows: (0..n)
                .map(|i| {
                    let t = start + i as f64 / 10.0;
                    let angle = speed * (t - start) / RADIUS;
                    TrajectoryRow {
                        t,
                        x: RADIUS * angle.cos(),
                        y: RADIUS * angle.sin(),
                        speed,
                        ..Default::default()
                    }
                })
                .collect(),
            ..Default::default()
        }
    }

    fn lap(start_index: usize, end_index: usize, traj: &VehicleTrajectory) -> LapRecord {
        LapRecord {
            vehicle_id: traj.vehicle_id.clone(),
            lap_number: 1,
            start_index,
            end_index,
            start_time: traj.rows[start_index].t,
            end_time: if end_index < traj.len() {
                traj.rows[end_index].t
            } else {
                traj.end_time()
            },
            complete: false,
            trigger: LapTrigger::RecordingStart,
        }
    }

    #[test]
    fn test_delta_against_constant_reference() {
        let reference = reference(20.0);
        let traj = trajectory(25.0, 0.0, 20.0);
        let laps = vec![lap(0, traj.len(), &traj)];
        let trail = DeltaTrailGenerator::new(&reference).generate(
            &traj,
            &laps,
            TrailWindow {
                end_time: 15.0,
                duration_s: 5.0,
            },
        );
        assert_eq!(trail.len(), 51);
        for segment in &trail {
            assert!((segment.delta_speed - 5.0).abs() < 1e-9);
            assert!((segment.curvature - 0.01).abs() < 1e-12);
        }
        for pair in trail.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
        assert!((trail[0].t_rel - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_truncated_at_recording_start() {
        let reference = reference(20.0);
        let traj = trajectory(20.0, 3.0, 10.0);
        let laps = vec![lap(0, traj.len(), &traj)];
        let trail = DeltaTrailGenerator::new(&reference).generate(
            &traj,
            &laps,
            TrailWindow {
                end_time: 5.0,
                duration_s: 15.0,
            },
        );
        assert_eq!(trail.len(), 21);
        assert!(trail.iter().all(|s| s.timestamp >= traj.start_time()));
        assert_eq!(trail[0].timestamp, 3.0);
    }

    #[test]
    fn test_window_before_recording_is_empty() {
        let reference = reference(20.0);
        let traj = trajectory(20.0, 3.0, 10.0);
        let trail = DeltaTrailGenerator::new(&reference).generate(
            &traj,
            &[],
            TrailWindow {
                end_time: 2.0,
                duration_s: 15.0,
            },
        );
        assert!(trail.is_empty());
    }

    #[test]
    fn test_window_truncated_at_lap_boundary() {
        let reference = reference(20.0);
        let traj = trajectory(20.0, 0.0, 30.0);
        let laps = vec![lap(0, 100, &traj), lap(100, traj.len(), &traj)];
        let trail = DeltaTrailGenerator::new(&reference).generate(
            &traj,
            &laps,
            TrailWindow {
                end_time: 12.0,
                duration_s: 15.0,
            },
        );
        assert_eq!(trail[0].timestamp, 10.0);
        assert_eq!(trail[0].t_rel, 0.0);
        assert_eq!(trail.len(), 21);
    }

    #[test]
    fn test_heading_follows_travel() {
        let reference = reference(20.0);
        let traj = trajectory(20.0, 0.0, 10.0);
        let trail = DeltaTrailGenerator::new(&reference).generate(
            &traj,
            &[],
            TrailWindow {
                end_time: 0.5,
                duration_s: 1.0,
            },
        );
        // Counter-clockwise from (R, 0) heads north
        assert!((trail[0].heading - std::f64::consts::FRAC_PI_2).abs() < 0.02);
    }
}
