pub mod alignment;
pub mod loader;
pub mod projection;
pub mod resampler;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::track::geometry::{BoundingBox, Point2D};

pub use alignment::{align_to_race_start, detect_race_start};
pub use loader::{SchemaReport, load_telemetry, read_telemetry, validate_schema};
pub use projection::{GeoPoint, LocalProjector};
pub use resampler::{ChannelResampler, ResamplerConfig};

pub type VehicleId = String;

/// Telemetry channels understood by the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    Latitude,
    Longitude,
    Speed,
    BrakeFront,
    BrakeRear,
    /// Single brake channel used by cars without split front/rear sensors
    Brake,
    Throttle,
    Steering,
    Gear,
    Rpm,
    AccelX,
    AccelY,
    LapDistance,
}

impl Channel {
    /// Map a raw `telemetry_name` to a channel. Names are case-sensitive.
    pub fn from_telemetry_name(name: &str) -> Option<Self> {
        match name {
            "VBOX_Lat_Min" => Some(Self::Latitude),
            "VBOX_Long_Minutes" => Some(Self::Longitude),
            "speed" => Some(Self::Speed),
            "pbrake_f" => Some(Self::BrakeFront),
            "pbrake_r" => Some(Self::BrakeRear),
            "brake" => Some(Self::Brake),
            "aps" => Some(Self::Throttle),
            "Steering_Angle" => Some(Self::Steering),
            "gear" => Some(Self::Gear),
            "nmot" => Some(Self::Rpm),
            "accx_can" => Some(Self::AccelX),
            "accy_can" => Some(Self::AccelY),
            "Laptrigger_lapdist_dls" => Some(Self::LapDistance),
            _ => None,
        }
    }

    pub fn telemetry_name(&self) -> &'static str {
        match self {
            Self::Latitude => "VBOX_Lat_Min",
            Self::Longitude => "VBOX_Long_Minutes",
            Self::Speed => "speed",
            Self::BrakeFront => "pbrake_f",
            Self::BrakeRear => "pbrake_r",
            Self::Brake => "brake",
            Self::Throttle => "aps",
            Self::Steering => "Steering_Angle",
            Self::Gear => "gear",
            Self::Rpm => "nmot",
            Self::AccelX => "accx_can",
            Self::AccelY => "accy_can",
            Self::LapDistance => "Laptrigger_lapdist_dls",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.telemetry_name())
    }
}

/// One raw row of the long-format input
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetrySample {
    pub vehicle_id: VehicleId,
    /// Absolute time in seconds
    pub timestamp: f64,
    /// Lap counter as reported by the logger, when present and sane
    pub lap: Option<u32>,
    pub channel: Channel,
    pub value: f64,
}

/// Irregular per-channel series for one vehicle, sorted by time with duplicates collapsed
#[derive(Clone, Debug, Default)]
pub struct VehicleChannels {
    pub vehicle_id: VehicleId,
    pub series: BTreeMap<Channel, Vec<(f64, f64)>>,
    /// First and last timestamp observed for each logger lap number
    pub lap_spans: BTreeMap<u32, (f64, f64)>,
}

impl VehicleChannels {
    pub fn new(vehicle_id: impl Into<VehicleId>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            ..Default::default()
        }
    }

    pub fn series(&self, channel: Channel) -> Option<&[(f64, f64)]> {
        self.series
            .get(&channel)
            .map(|s| s.as_slice())
            .filter(|s| !s.is_empty())
    }

    pub fn has(&self, channel: Channel) -> bool {
        self.series(channel).is_some()
    }

    /// Time span covered by a logger lap number
    pub fn lap_span(&self, lap: u32) -> Option<(f64, f64)> {
        self.lap_spans.get(&lap).copied()
    }
}

/// All telemetry of one session, grouped by vehicle
#[derive(Clone, Debug, Default)]
pub struct TelemetryBatch {
    pub vehicles: BTreeMap<VehicleId, VehicleChannels>,
    /// Absolute time (seconds) every series is relative to: the earliest sample,
    /// or the race start once aligned
    pub time_origin: f64,
    pub row_count: usize,
}

/// Column names of the dense per-vehicle trajectory array, in order
pub const TRAJECTORY_COLUMNS: [&str; 11] = [
    "x",
    "y",
    "speed",
    "brake_front",
    "brake_rear",
    "throttle",
    "steering",
    "gear",
    "rpm",
    "accel_x",
    "accel_y",
];

/// One uniform time step of a resampled trajectory
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct TrajectoryRow {
    /// Seconds since the session time origin
    pub t: f64,
    /// Meters east of the anchor
    pub x: f64,
    /// Meters north of the anchor
    pub y: f64,
    /// Speed in m/s
    pub speed: f64,
    /// Front brake, 0..1 when normalised
    pub brake_front: f64,
    /// Rear brake, 0..1 when normalised
    pub brake_rear: f64,
    pub throttle: f64,
    pub steering: f64,
    pub gear: f64,
    pub rpm: f64,
    /// Longitudinal acceleration
    pub accel_x: f64,
    /// Lateral acceleration
    pub accel_y: f64,
}

impl TrajectoryRow {
    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }

    /// Row values in `TRAJECTORY_COLUMNS` order
    pub fn values(&self) -> [f64; 11] {
        [
            self.x,
            self.y,
            self.speed,
            self.brake_front,
            self.brake_rear,
            self.throttle,
            self.steering,
            self.gear,
            self.rpm,
            self.accel_x,
            self.accel_y,
        ]
    }
}

/// Dense, uniformly sampled trajectory of one vehicle. Immutable once built.
#[derive(Clone, Debug, Default)]
pub struct VehicleTrajectory {
    pub vehicle_id: VehicleId,
    pub step_s: f64,
    pub rows: Vec<TrajectoryRow>,
    /// Lap distance per row, when the vehicle logged it; `None` on rows before its first sample
    pub lap_distance: Option<Vec<Option<f64>>>,
    /// Channels with no data at all, filled with zero
    pub missing_channels: Vec<Channel>,
    /// Channels whose data starts after the trajectory start, zero until their first sample
    pub partial_channels: Vec<Channel>,
    pub separate_brake_channels: bool,
}

impl VehicleTrajectory {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn start_time(&self) -> f64 {
        self.rows.first().map(|r| r.t).unwrap_or(0.0)
    }

    pub fn end_time(&self) -> f64 {
        self.rows.last().map(|r| r.t).unwrap_or(0.0)
    }

    /// Index of the last row at or before `t`, clamped to the trajectory
    pub fn index_at(&self, t: f64) -> usize {
        if self.rows.is_empty() || t <= self.start_time() {
            return 0;
        }
        let index = self.rows.partition_point(|row| row.t <= t);
        index.saturating_sub(1).min(self.rows.len() - 1)
    }

    /// Rows with `t0 <= t <= t1`
    pub fn slice(&self, t0: f64, t1: f64) -> &[TrajectoryRow] {
        let start = self.rows.partition_point(|row| row.t < t0);
        let end = self.rows.partition_point(|row| row.t <= t1);
        if start >= end {
            return &[];
        }
        &self.rows[start..end]
    }

    pub fn bounds(&self) -> BoundingBox {
        let mut bbox = BoundingBox::new();
        for row in &self.rows {
            bbox.update(row.position());
        }
        bbox
    }
}
