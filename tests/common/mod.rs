// Synthetic long-format telemetry for integration tests
#![allow(dead_code)]

use std::f64::consts::{FRAC_PI_2, TAU};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use laptrace::PipelineConfig;
use laptrace::telemetry::projection::EARTH_RADIUS_M;

pub const RADIUS_M: f64 = 100.0;
pub const BASE_LAT: f64 = 38.1614;
pub const BASE_LON: f64 = -122.4549;
pub const TIME_BASE: f64 = 1_000.0;

pub fn track_length() -> f64 {
    TAU * RADIUS_M
}

/// Speed that drives one lap of the test circle in `lap_time` seconds
pub fn speed_for_lap_time(lap_time: f64) -> f64 {
    track_length() / lap_time
}

#[derive(Debug, Clone)]
pub struct SyntheticVehicle {
    pub vehicle_id: String,
    pub speed_ms: f64,
    pub gps: bool,
    pub lap_distance: bool,
    /// Meters past the line at the first sample
    pub start_offset_m: f64,
    /// Lap distance is only logged from this time on
    pub lap_distance_from_s: f64,
    /// Times at which the lap distance reads 0 for a single sample
    pub lap_distance_glitches: Vec<f64>,
    /// Number of out-of-range GPS fixes, spread two seconds apart
    pub invalid_fixes: usize,
}

impl SyntheticVehicle {
    pub fn new(vehicle_id: &str, lap_time: f64) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            speed_ms: speed_for_lap_time(lap_time),
            gps: true,
            lap_distance: true,
            start_offset_m: 0.0,
            lap_distance_from_s: 0.0,
            lap_distance_glitches: Vec::new(),
            invalid_fixes: 0,
        }
    }

    pub fn starting_at(mut self, offset_m: f64) -> Self {
        self.start_offset_m = offset_m;
        self
    }

    pub fn with_lap_distance_from(mut self, t: f64) -> Self {
        self.lap_distance_from_s = t;
        self
    }

    pub fn with_lap_distance_glitch(mut self, at_s: f64) -> Self {
        self.lap_distance_glitches.push(at_s);
        self
    }

    pub fn with_invalid_fixes(mut self, count: usize) -> Self {
        self.invalid_fixes = count;
        self
    }

    pub fn without_gps(mut self) -> Self {
        self.gps = false;
        self
    }

    pub fn without_lap_distance(mut self) -> Self {
        self.lap_distance = false;
        self
    }
}

/// Vehicles lapping a circle that starts at the ENU origin heading east
#[derive(Debug, Clone)]
pub struct SyntheticSession {
    pub duration_s: f64,
    pub rate_hz: f64,
    pub vehicles: Vec<SyntheticVehicle>,
}

impl SyntheticSession {
    pub fn new(duration_s: f64, rate_hz: f64, vehicles: Vec<SyntheticVehicle>) -> Self {
        Self {
            duration_s,
            rate_hz,
            vehicles,
        }
    }

    pub fn to_csv(&self) -> String {
        let mut csv = String::from("timestamp,vehicle_id,lap,telemetry_name,telemetry_value\n");
        let samples = (self.duration_s * self.rate_hz).round() as usize;
        let length = track_length();
        let meters_per_deg_lat = EARTH_RADIUS_M * TAU / 360.0;
        let meters_per_deg_lon = meters_per_deg_lat * BASE_LAT.to_radians().cos();

        for vehicle in &self.vehicles {
            let v = vehicle.speed_ms;
            for i in 0..=samples {
                let t = i as f64 / self.rate_hz;
                let travelled = vehicle.start_offset_m + v * t;
                let lap = (travelled / length).floor() as u32 + 1;
                let distance = travelled % length;
                let angle = -FRAC_PI_2 + TAU * distance / length;
                let x = RADIUS_M * angle.cos();
                let y = RADIUS_M + RADIUS_M * angle.sin();
                let brake = if distance > 0.8 * length { 40.0 } else { 0.0 };

                let mut channels: Vec<(&str, f64)> = vec![
                    ("speed", v * 3.6),
                    ("pbrake_f", brake),
                    ("pbrake_r", brake * 0.6),
                    ("aps", 100.0 - brake),
                    ("Steering_Angle", 12.0),
                    ("gear", 3.0),
                    ("nmot", 5500.0 + 10.0 * v),
                    ("accx_can", 0.0),
                    ("accy_can", v * v / RADIUS_M / 9.81),
                ];
                if vehicle.gps {
                    let two_seconds = (2.0 * self.rate_hz).round() as usize;
                    let invalid = i >= two_seconds
                        && i % two_seconds == 0
                        && i / two_seconds <= vehicle.invalid_fixes;
                    let lat = if invalid {
                        91.0
                    } else {
                        BASE_LAT + y / meters_per_deg_lat
                    };
                    channels.push(("VBOX_Lat_Min", lat));
                    channels.push(("VBOX_Long_Minutes", BASE_LON + x / meters_per_deg_lon));
                }
                if vehicle.lap_distance && t >= vehicle.lap_distance_from_s {
                    let glitch = vehicle
                        .lap_distance_glitches
                        .iter()
                        .any(|at| (at * self.rate_hz).round() as usize == i);
                    channels.push(("Laptrigger_lapdist_dls", if glitch { 0.0 } else { distance }));
                }
                for (name, value) in channels {
                    let _ = writeln!(
                        csv,
                        "{:.3},{},{},{},{:.9}",
                        TIME_BASE + t,
                        vehicle.vehicle_id,
                        lap,
                        name,
                        value
                    );
                }
            }
        }
        csv
    }

    pub fn write_to(&self, dir: &Path) -> PathBuf {
        let path = dir.join("session.csv");
        fs::write(&path, self.to_csv()).unwrap();
        path
    }
}

/// Defaults with a racing line coarse enough for debug-build tests
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        racing_line_points: 2_000,
        workers: Some(2),
        ..Default::default()
    }
}

/// Two vehicles lapping in 25 s and 22.5 s for a minute
pub fn two_car_session() -> SyntheticSession {
    SyntheticSession::new(
        60.0,
        20.0,
        vec![
            SyntheticVehicle::new("GR86-002", 25.0),
            SyntheticVehicle::new("GR86-004", 22.5),
        ],
    )
}
