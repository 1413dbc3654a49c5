use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use uom::si::f64::Velocity;
use uom::si::velocity::{kilometer_per_hour, meter_per_second, mile_per_hour};

use crate::LaptraceError;
use crate::laps::SegmenterConfig;
use crate::telemetry::ResamplerConfig;

const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_SAMPLE_STEP_MS: u64 = 10;
pub const DEFAULT_RACING_LINE_POINTS: usize = 30_000;
pub const MIN_TRAIL_WINDOW_S: f64 = 1.0;
pub const MAX_TRAIL_WINDOW_S: f64 = 15.0;

/// Unit of the raw `speed` channel
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeedUnit {
    #[default]
    Kph,
    Mps,
    Mph,
}

impl SpeedUnit {
    pub fn to_meters_per_second(&self, value: f64) -> f64 {
        let velocity = match self {
            Self::Kph => Velocity::new::<kilometer_per_hour>(value),
            Self::Mps => Velocity::new::<meter_per_second>(value),
            Self::Mph => Velocity::new::<mile_per_hour>(value),
        };
        velocity.get::<meter_per_second>()
    }
}

/// Which laps and vehicles may shape the reference racing lines
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReferenceFilter {
    /// Ignore laps falling in the logger's lap 1, usually an out lap
    pub skip_first_logger_lap: bool,
    /// Laps with fewer valid GPS fixes are ignored
    pub min_gps_fixes: usize,
    /// Laps no longer than this are ignored
    pub min_lap_time_s: Option<f64>,
    /// Vehicles whose median lap time lies further than this many standard
    /// deviations from the field stay out of the canonical line
    pub outlier_z_score: Option<f64>,
}

impl Default for ReferenceFilter {
    fn default() -> Self {
        Self {
            skip_first_logger_lap: false,
            min_gps_fixes: 50,
            min_lap_time_s: None,
            outlier_z_score: Some(2.5),
        }
    }
}

/// Tunables for one processing run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Uniform output step of every trajectory
    pub sample_step_ms: u64,
    /// Widest gap between two raw samples that is still interpolated
    pub gap_tolerance_s: f64,
    pub speed_unit: SpeedUnit,
    pub normalize_brakes: bool,
    /// Drop in lap distance that counts as crossing the line
    pub lap_reset_threshold_m: f64,
    /// Lap triggers closer together than this are treated as noise
    pub min_lap_duration_s: f64,
    /// A recording starting within this lap distance starts on the line
    pub start_line_tolerance_m: f64,
    pub start_finish_radius_m: f64,
    pub racing_line_points: usize,
    pub per_car_racing_lines: bool,
    pub trail_window_s: f64,
    /// Vehicle whose lap provides the projection anchor
    pub reference_vehicle: Option<String>,
    /// Logger lap number of the anchor lap
    pub reference_lap: Option<u32>,
    /// Split the track into this many equal-distance sectors
    pub sector_count: Option<usize>,
    /// Explicit sector start distances in meters, first one at 0
    pub sector_boundaries_m: Option<Vec<f64>>,
    /// Worker pool size, defaults to the number of cores
    pub workers: Option<usize>,
    pub reference_filter: ReferenceFilter,
    /// Rebase session time on the detected race start and drop earlier samples
    pub align_race_start: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_step_ms: DEFAULT_SAMPLE_STEP_MS,
            gap_tolerance_s: 0.5,
            speed_unit: SpeedUnit::Kph,
            normalize_brakes: true,
            lap_reset_threshold_m: 100.0,
            min_lap_duration_s: 20.0,
            start_line_tolerance_m: 10.0,
            start_finish_radius_m: 15.0,
            racing_line_points: DEFAULT_RACING_LINE_POINTS,
            per_car_racing_lines: true,
            trail_window_s: MAX_TRAIL_WINDOW_S,
            reference_vehicle: None,
            reference_lap: None,
            sector_count: None,
            sector_boundaries_m: None,
            workers: None,
            reference_filter: ReferenceFilter::default(),
            align_race_start: false,
        }
    }
}

impl PipelineConfig {
    pub fn default_path() -> Result<PathBuf, LaptraceError> {
        Ok(dirs::config_dir()
            .ok_or(LaptraceError::NoConfigDir)?
            .join("laptrace")
            .join(CONFIG_FILE_NAME))
    }

    pub fn from_file(path: &Path) -> Result<Self, LaptraceError> {
        let file =
            std::fs::File::open(path).map_err(|e| LaptraceError::ConfigIOError { source: e })?;
        let config: Self = serde_json::from_reader(file)
            .map_err(|e| LaptraceError::ConfigParseError { source: e })?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load the user's config file when there is one
    pub fn from_local_file() -> Option<Self> {
        let config_path = Self::default_path().ok()?;
        if !config_path.exists() {
            debug!("No config file at {:?}", config_path);
            return None;
        }
        Self::from_file(&config_path).ok()
    }

    pub fn save(&self, path: &Path) -> Result<(), LaptraceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LaptraceError::ConfigIOError { source: e })?;
        }
        let file =
            std::fs::File::create(path).map_err(|e| LaptraceError::ConfigIOError { source: e })?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| LaptraceError::ConfigParseError { source: e })
    }

    pub fn validate(&self) -> Result<(), LaptraceError> {
        let invalid = |field: &str, reason: &str| {
            Err(LaptraceError::InvalidConfig {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.sample_step_ms == 0 {
            return invalid("sample_step_ms", "must be positive");
        }
        if !(self.gap_tolerance_s > 0.0) {
            return invalid("gap_tolerance_s", "must be positive");
        }
        if !(self.lap_reset_threshold_m > 0.0) {
            return invalid("lap_reset_threshold_m", "must be positive");
        }
        if !(self.min_lap_duration_s >= 0.0) {
            return invalid("min_lap_duration_s", "must not be negative");
        }
        if self.racing_line_points < 8 {
            return invalid("racing_line_points", "must be at least 8");
        }
        if !(MIN_TRAIL_WINDOW_S..=MAX_TRAIL_WINDOW_S).contains(&self.trail_window_s) {
            return invalid("trail_window_s", "must be between 1 and 15 seconds");
        }
        if self.sector_count == Some(0) {
            return invalid("sector_count", "must be at least 1");
        }
        if let Some(boundaries) = &self.sector_boundaries_m {
            if boundaries.first() != Some(&0.0) {
                return invalid("sector_boundaries_m", "first sector must start at 0");
            }
            if boundaries.windows(2).any(|pair| !(pair[0] < pair[1])) {
                return invalid("sector_boundaries_m", "must be strictly increasing");
            }
        }
        if self.workers == Some(0) {
            return invalid("workers", "must be at least 1");
        }
        if self
            .reference_filter
            .min_lap_time_s
            .is_some_and(|min| !(min >= 0.0))
        {
            return invalid("reference_filter.min_lap_time_s", "must not be negative");
        }
        if self
            .reference_filter
            .outlier_z_score
            .is_some_and(|z| !(z > 0.0))
        {
            return invalid("reference_filter.outlier_z_score", "must be positive");
        }
        Ok(())
    }

    pub fn sample_step_s(&self) -> f64 {
        self.sample_step_ms as f64 / 1000.0
    }

    pub fn resampler(&self) -> ResamplerConfig {
        ResamplerConfig {
            step_s: self.sample_step_s(),
            gap_tolerance_s: self.gap_tolerance_s,
            speed_unit: self.speed_unit,
            normalize_brakes: self.normalize_brakes,
        }
    }

    pub fn segmenter(&self) -> SegmenterConfig {
        SegmenterConfig {
            reset_threshold_m: self.lap_reset_threshold_m,
            min_lap_duration_s: self.min_lap_duration_s,
            start_line_tolerance_m: self.start_line_tolerance_m,
            start_finish: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_step_s(), 0.01);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"sample_step_ms": 20, "sector_count": 3}"#).unwrap();
        assert_eq!(config.sample_step_ms, 20);
        assert_eq!(config.sector_count, Some(3));
        assert_eq!(config.racing_line_points, DEFAULT_RACING_LINE_POINTS);
        assert_eq!(config.reference_filter, ReferenceFilter::default());

        let config: PipelineConfig = serde_json::from_str(
            r#"{"align_race_start": true, "reference_filter": {"skip_first_logger_lap": true}}"#,
        )
        .unwrap();
        assert!(config.align_race_start);
        assert!(config.reference_filter.skip_first_logger_lap);
        assert_eq!(config.reference_filter.min_gps_fixes, 50);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            PipelineConfig {
                sample_step_ms: 0,
                ..Default::default()
            },
            PipelineConfig {
                trail_window_s: 30.0,
                ..Default::default()
            },
            PipelineConfig {
                sector_boundaries_m: Some(vec![0.0, 500.0, 400.0]),
                ..Default::default()
            },
            PipelineConfig {
                sector_boundaries_m: Some(vec![10.0, 500.0]),
                ..Default::default()
            },
            PipelineConfig {
                reference_filter: ReferenceFilter {
                    outlier_z_score: Some(0.0),
                    ..Default::default()
                },
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(LaptraceError::InvalidConfig { .. })
            ));
        }
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let config = PipelineConfig {
            reference_vehicle: Some("GR86-002".to_string()),
            reference_lap: Some(4),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_speed_units() {
        assert!((SpeedUnit::Kph.to_meters_per_second(36.0) - 10.0).abs() < 1e-9);
        assert!((SpeedUnit::Mph.to_meters_per_second(100.0) - 44.704).abs() < 1e-9);
        assert!((SpeedUnit::Mps.to_meters_per_second(12.5) - 12.5).abs() < 1e-12);
    }
}
