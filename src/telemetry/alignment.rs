// Race start detection and rebasing of session time on it

use std::borrow::Cow;

use itertools::Itertools;
use log::{debug, info, warn};

use crate::config::SpeedUnit;

use super::{Channel, TelemetryBatch, VehicleChannels};

/// Movement must be sustained this long before a lap-distance reset counts as the start
pub const RACE_START_WINDOW_S: f64 = 3.0;
/// Slowest speed (20 mph) that counts as moving
pub const RACE_START_MIN_SPEED_MS: f64 = 8.9408;

/// Time of a vehicle's race start: its first lap-distance reset after
/// [`RACE_START_WINDOW_S`] of continuous movement.
///
/// Falls back to the first reset made at speed, then to the first reset.
/// `None` when the lap distance never resets.
pub fn detect_race_start(
    channels: &VehicleChannels,
    speed_unit: SpeedUnit,
    reset_threshold_m: f64,
) -> Option<f64> {
    let distances = channels.series(Channel::LapDistance)?;
    let resets = distances
        .windows(2)
        .filter(|pair| pair[1].1 - pair[0].1 < -reset_threshold_m)
        .map(|pair| pair[1].0)
        .collect_vec();
    let first_reset = *resets.first()?;
    let speed = channels.series(Channel::Speed).unwrap_or_default();
    let moving = |value: f64| speed_unit.to_meters_per_second(value) > RACE_START_MIN_SPEED_MS;

    if let Some(window_start) = first_moving_window(speed, moving) {
        if let Some(reset) = resets.iter().find(|t| **t >= window_start) {
            return Some(*reset);
        }
    }
    debug!(
        "No reset of {} follows sustained movement",
        channels.vehicle_id
    );
    resets
        .iter()
        .copied()
        .find(|t| speed_at(speed, *t).is_some_and(moving))
        .or(Some(first_reset))
}

/// Start of the first window in which every speed sample is moving
fn first_moving_window(speed: &[(f64, f64)], moving: impl Fn(f64) -> bool) -> Option<f64> {
    let mut run_start: Option<f64> = None;
    for &(t, value) in speed {
        if moving(value) {
            let start = *run_start.get_or_insert(t);
            if t >= start + RACE_START_WINDOW_S {
                return Some(start);
            }
        } else {
            if run_start.is_some_and(|start| t >= start + RACE_START_WINDOW_S) {
                return run_start;
            }
            run_start = None;
        }
    }
    // A run still going at the end of the recording fills the window it has
    run_start
}

/// Last speed sample at or before `t`
fn speed_at(speed: &[(f64, f64)], t: f64) -> Option<f64> {
    let index = speed.partition_point(|s| s.0 <= t);
    index.checked_sub(1).map(|i| speed[i].1)
}

impl TelemetryBatch {
    /// Copy of the batch with its time origin moved `offset_s` seconds later.
    /// Samples before the new origin are dropped.
    pub fn rebased(&self, offset_s: f64) -> Self {
        let mut vehicles = self.vehicles.clone();
        for vehicle in vehicles.values_mut() {
            for series in vehicle.series.values_mut() {
                series.retain(|sample| sample.0 >= offset_s);
                for sample in series.iter_mut() {
                    sample.0 -= offset_s;
                }
            }
            vehicle.lap_spans.retain(|_, span| span.1 >= offset_s);
            for span in vehicle.lap_spans.values_mut() {
                span.0 = (span.0 - offset_s).max(0.0);
                span.1 -= offset_s;
            }
        }
        Self {
            vehicles,
            time_origin: self.time_origin + offset_s,
            row_count: self.row_count,
        }
    }
}

/// Rebase the session on the earliest race start of any vehicle.
///
/// Every vehicle keeps the shared clock. When no vehicle shows a race start
/// the batch is returned untouched.
pub fn align_to_race_start(
    batch: &TelemetryBatch,
    speed_unit: SpeedUnit,
    reset_threshold_m: f64,
) -> Cow<'_, TelemetryBatch> {
    let start = batch
        .vehicles
        .values()
        .filter_map(|channels| {
            let start = detect_race_start(channels, speed_unit, reset_threshold_m);
            if let Some(t) = start {
                debug!("Vehicle {} race start at {:.2}s", channels.vehicle_id, t);
            }
            start
        })
        .min_by(f64::total_cmp);
    match start {
        Some(start) => {
            info!(
                "Aligning session on the race start, {:.2}s after the first sample",
                start
            );
            Cow::Owned(batch.rebased(start))
        }
        None => {
            warn!("No race start found, keeping the earliest sample as time origin");
            Cow::Borrowed(batch)
        }
    }
}
