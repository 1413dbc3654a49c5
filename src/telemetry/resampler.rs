// Channel resampler: irregular per-channel series onto one uniform time grid

use log::{debug, info};

use crate::config::SpeedUnit;
use crate::errors::LaptraceError;
use crate::track::geometry::Point2D;

use super::{Channel, TrajectoryRow, VehicleChannels, VehicleTrajectory};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResamplerConfig {
    /// Output step in seconds
    pub step_s: f64,
    /// Samples further apart than this are not interpolated; the older value is held
    pub gap_tolerance_s: f64,
    pub speed_unit: SpeedUnit,
    /// Scale brake columns to 0..1 by the vehicle's maximum
    pub normalize_brakes: bool,
}

impl Default for ResamplerConfig {
    fn default() -> Self {
        Self {
            step_s: 0.01,
            gap_tolerance_s: 0.5,
            speed_unit: SpeedUnit::Kph,
            normalize_brakes: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Interpolation {
    Linear,
    /// Previous sample held until the next one, for discrete channels
    Hold,
    /// Linear while increasing, held across resets
    Monotonic,
}

/// Walks a sorted series forward in time
struct SeriesCursor<'a> {
    series: &'a [(f64, f64)],
    index: usize,
    gap_tolerance_s: f64,
    interpolation: Interpolation,
}

impl<'a> SeriesCursor<'a> {
    fn new(series: &'a [(f64, f64)], gap_tolerance_s: f64, interpolation: Interpolation) -> Self {
        Self {
            series,
            index: 0,
            gap_tolerance_s,
            interpolation,
        }
    }

    fn starts_after(&self, t: f64) -> bool {
        self.series.first().is_none_or(|s| s.0 > t)
    }

    /// Value at `t`, `None` before the first sample. Queries must not go back in time.
    fn sample(&mut self, t: f64) -> Option<f64> {
        while self.index + 1 < self.series.len() && self.series[self.index + 1].0 <= t {
            self.index += 1;
        }
        let &(t0, v0) = self.series.get(self.index)?;
        if t0 > t {
            return None;
        }
        let Some(&(t1, v1)) = self.series.get(self.index + 1) else {
            return Some(v0);
        };
        if t1 - t0 > self.gap_tolerance_s {
            return Some(v0);
        }
        match self.interpolation {
            Interpolation::Hold => Some(v0),
            Interpolation::Monotonic if v1 < v0 => Some(v0),
            Interpolation::Linear | Interpolation::Monotonic => {
                Some(v0 + (v1 - v0) * (t - t0) / (t1 - t0))
            }
        }
    }
}

/// Optional output column, its source series and how it fills rows
struct ColumnSource<'a> {
    channel: Channel,
    cursor: Option<SeriesCursor<'a>>,
}

pub struct ChannelResampler {
    config: ResamplerConfig,
}

impl ChannelResampler {
    pub fn new(config: ResamplerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResamplerConfig {
        &self.config
    }

    /// Build the dense trajectory of one vehicle.
    ///
    /// `positions` are the vehicle's projected GPS fixes. The grid covers only
    /// the time range where both positions and speed have real samples.
    pub fn resample(
        &self,
        channels: &VehicleChannels,
        positions: &[(f64, Point2D)],
    ) -> Result<VehicleTrajectory, LaptraceError> {
        let vehicle_id = channels.vehicle_id.clone();
        let insufficient = |channel: Channel| LaptraceError::InsufficientChannelData {
            vehicle_id: vehicle_id.clone(),
            channel,
        };

        let (Some(first_fix), Some(last_fix)) = (positions.first(), positions.last()) else {
            return Err(insufficient(Channel::Latitude));
        };
        let speed = channels
            .series(Channel::Speed)
            .ok_or_else(|| insufficient(Channel::Speed))?;

        let start = first_fix.0.max(speed[0].0);
        let end = last_fix.0.min(speed[speed.len() - 1].0);
        if end < start {
            return Err(insufficient(Channel::Speed));
        }

        let step = self.config.step_s;
        let row_count = ((end - start) / step + 1e-9).floor() as usize + 1;

        let xs: Vec<(f64, f64)> = positions.iter().map(|(t, p)| (*t, p.x)).collect();
        let ys: Vec<(f64, f64)> = positions.iter().map(|(t, p)| (*t, p.y)).collect();
        let gap = self.config.gap_tolerance_s;
        let mut x_cursor = SeriesCursor::new(&xs, gap, Interpolation::Linear);
        let mut y_cursor = SeriesCursor::new(&ys, gap, Interpolation::Linear);
        let mut speed_cursor = SeriesCursor::new(speed, gap, Interpolation::Linear);

        let separate_brake_channels =
            channels.has(Channel::BrakeFront) || channels.has(Channel::BrakeRear);
        let brake_source = |split: Channel| {
            if channels.has(split) {
                Some(split)
            } else if channels.has(Channel::Brake) {
                Some(Channel::Brake)
            } else {
                None
            }
        };

        let column = |channel: Channel, source: Option<Channel>, interpolation| ColumnSource {
            channel,
            cursor: source
                .and_then(|s| channels.series(s))
                .map(|series| SeriesCursor::new(series, gap, interpolation)),
        };
        // Order matches the optional TrajectoryRow fields
        let mut columns = [
            column(
                Channel::BrakeFront,
                brake_source(Channel::BrakeFront),
                Interpolation::Linear,
            ),
            column(
                Channel::BrakeRear,
                brake_source(Channel::BrakeRear),
                Interpolation::Linear,
            ),
            column(Channel::Throttle, Some(Channel::Throttle), Interpolation::Linear),
            column(Channel::Steering, Some(Channel::Steering), Interpolation::Linear),
            column(Channel::Gear, Some(Channel::Gear), Interpolation::Hold),
            column(Channel::Rpm, Some(Channel::Rpm), Interpolation::Linear),
            column(Channel::AccelX, Some(Channel::AccelX), Interpolation::Linear),
            column(Channel::AccelY, Some(Channel::AccelY), Interpolation::Linear),
        ];
        let mut lap_distance_cursor = channels
            .series(Channel::LapDistance)
            .map(|series| SeriesCursor::new(series, gap, Interpolation::Monotonic));

        let mut missing_channels = Vec::new();
        let mut partial_channels = Vec::new();
        for column in &columns {
            match &column.cursor {
                None => missing_channels.push(column.channel),
                Some(cursor) if cursor.starts_after(start) => partial_channels.push(column.channel),
                Some(_) => {}
            }
        }
        match &lap_distance_cursor {
            None => missing_channels.push(Channel::LapDistance),
            Some(cursor) if cursor.starts_after(start) => {
                partial_channels.push(Channel::LapDistance)
            }
            Some(_) => {}
        }

        let mut rows = Vec::with_capacity(row_count);
        let mut lap_distance = lap_distance_cursor
            .as_ref()
            .map(|_| Vec::with_capacity(row_count));
        for i in 0..row_count {
            let t = (start + i as f64 * step).min(end);
            // Position and speed exist over the whole clipped range
            let mut row = TrajectoryRow {
                t,
                x: x_cursor.sample(t).unwrap_or(first_fix.1.x),
                y: y_cursor.sample(t).unwrap_or(first_fix.1.y),
                speed: self
                    .config
                    .speed_unit
                    .to_meters_per_second(speed_cursor.sample(t).unwrap_or(speed[0].1)),
                ..Default::default()
            };
            let mut values = [0.0; 8];
            for (value, column) in values.iter_mut().zip(columns.iter_mut()) {
                if let Some(cursor) = column.cursor.as_mut() {
                    *value = cursor.sample(t).unwrap_or(0.0);
                }
            }
            [
                row.brake_front,
                row.brake_rear,
                row.throttle,
                row.steering,
                row.gear,
                row.rpm,
                row.accel_x,
                row.accel_y,
            ] = values;
            rows.push(row);

            if let (Some(cursor), Some(distances)) =
                (lap_distance_cursor.as_mut(), lap_distance.as_mut())
            {
                // Unknown until the first sample, never a plausible 0 m
                distances.push(cursor.sample(t));
            }
        }

        if self.config.normalize_brakes {
            normalize_column(&mut rows, |row| &mut row.brake_front);
            normalize_column(&mut rows, |row| &mut row.brake_rear);
        }

        if !missing_channels.is_empty() {
            debug!("Vehicle {vehicle_id} is missing channels {missing_channels:?}");
        }
        info!(
            "Resampled vehicle {}: {} rows from {:.2}s to {:.2}s",
            vehicle_id, row_count, start, end
        );

        Ok(VehicleTrajectory {
            vehicle_id,
            step_s: step,
            rows,
            lap_distance,
            missing_channels,
            partial_channels,
            separate_brake_channels,
        })
    }
}

fn normalize_column(rows: &mut [TrajectoryRow], field: impl Fn(&mut TrajectoryRow) -> &mut f64) {
    let max = rows
        .iter_mut()
        .map(|row| *field(row))
        .fold(0.0f64, f64::max);
    if max > 0.0 {
        for row in rows.iter_mut() {
            *field(row) /= max;
        }
    }
}
