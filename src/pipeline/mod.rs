// Session processing: per-vehicle fan-out, racing line barrier, analysis fan-out

pub mod writer;

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use itertools::Itertools;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::analysis::{DeltaTrailGenerator, DeltaTrailSegment, TrailWindow};
use crate::config::PipelineConfig;
use crate::errors::LaptraceError;
use crate::laps::{LapRecord, LapSegmenter, StartFinishLine, fastest_lap, reference_laps};
use crate::telemetry::projection::pair_fixes;
use crate::telemetry::{
    Channel, ChannelResampler, GeoPoint, LocalProjector, TelemetryBatch, VehicleChannels,
    VehicleId, VehicleTrajectory, align_to_race_start, load_telemetry, validate_schema,
};
use crate::track::{
    BoundingBox, LapSource, Point2D, RacingLine, RacingLineBuilder, RacingLineKind, SectorEvent,
    SectorMap, SectorTimeline, SectorTimingEngine, TrackReference, outlier_vehicles,
};

pub use writer::{ArtifactWriter, write_artifacts};

/// Display colours handed out to vehicles in id order
pub const VEHICLE_PALETTE: [[u8; 3]; 18] = [
    [255, 68, 68],
    [68, 255, 68],
    [68, 68, 255],
    [255, 255, 68],
    [255, 68, 255],
    [68, 255, 255],
    [255, 136, 68],
    [136, 255, 68],
    [255, 136, 255],
    [136, 68, 255],
    [255, 200, 68],
    [68, 200, 255],
    [200, 68, 255],
    [255, 68, 136],
    [68, 255, 136],
    [136, 136, 255],
    [255, 136, 136],
    [136, 255, 255],
];

/// The anchor's travel direction is taken from the first fix at least this far away
const ANCHOR_DIRECTION_MIN_M: f64 = 5.0;

/// Shared flag that aborts a run between vehicles
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), LaptraceError> {
        if self.is_cancelled() {
            Err(LaptraceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything one processing run needs, owned by the caller
#[derive(Debug, Clone, Default)]
pub struct ProcessingContext {
    pub config: PipelineConfig,
    pub cancel: CancellationToken,
}

impl ProcessingContext {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(config: PipelineConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }
}

/// Non-fatal problem found while processing one vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum VehicleWarning {
    /// Position or speed data is missing, the vehicle is excluded
    InsufficientChannelData { channel: Channel },
    InvalidCoordinates { count: usize },
    MissingChannel { channel: Channel },
    PartialChannel { channel: Channel },
    NoCompleteLap,
    NoLapDistance,
    SectorTimingUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleReport {
    pub vehicle_id: VehicleId,
    pub included: bool,
    pub warnings: Vec<VehicleWarning>,
    pub rows: usize,
    pub laps: usize,
    pub complete_laps: usize,
    pub best_lap_s: Option<f64>,
}

impl VehicleReport {
    fn new(vehicle_id: &str) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            included: false,
            warnings: Vec::new(),
            rows: 0,
            laps: 0,
            complete_laps: 0,
            best_lap_s: None,
        }
    }

    fn excluded(mut self, warning: VehicleWarning) -> (VehicleReport, Option<VehicleRun>) {
        warn!("Excluding vehicle {}: {:?}", self.vehicle_id, warning);
        self.warnings.push(warning);
        (self, None)
    }
}

/// A vehicle that made it through resampling, with its laps
#[derive(Debug, Clone)]
pub struct VehicleRun {
    pub trajectory: VehicleTrajectory,
    pub laps: Vec<LapRecord>,
    /// Complete laps that passed the reference filter
    pub reference_laps: Vec<LapRecord>,
}

impl VehicleRun {
    /// Laps this vehicle contributes to the racing lines
    pub fn source(&self) -> LapSource<'_> {
        LapSource {
            trajectory: &self.trajectory,
            laps: &self.reference_laps,
        }
    }

    /// Median duration of the reference laps
    pub fn median_lap_time(&self) -> Option<f64> {
        median(self.reference_laps.iter().map(LapRecord::duration).collect())
    }
}

/// Published racing lines, each with its spatial index
#[derive(Debug, Clone, Default)]
pub struct TrackReferences {
    pub canonical: Option<TrackReference>,
    pub global_best: Option<TrackReference>,
    pub per_car: BTreeMap<VehicleId, TrackReference>,
}

impl TrackReferences {
    pub fn get(&self, kind: &RacingLineKind) -> Option<&TrackReference> {
        match kind {
            RacingLineKind::Canonical => self.canonical.as_ref(),
            RacingLineKind::GlobalBest => self.global_best.as_ref(),
            RacingLineKind::PerCar(vehicle_id) => self.per_car.get(vehicle_id),
        }
    }
}

/// Session descriptor read by the renderer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub bounds: BoundingBox,
    pub duration_s: f64,
    pub sample_step_s: f64,
    /// Absolute time trajectory times are relative to: the session's earliest
    /// sample, or the race start when aligned
    pub time_origin: f64,
    pub anchor: Option<GeoPoint>,
    pub vehicle_ids: Vec<VehicleId>,
    pub colors: BTreeMap<VehicleId, [u8; 3]>,
    pub per_car_racing_lines: bool,
    pub separate_brake_channels: bool,
    pub track_length_m: Option<f64>,
    pub ideal_lap_time_s: Option<f64>,
    pub sector_timing: bool,
    /// Every vehicle seen in the input, included or not
    pub vehicles: Vec<VehicleReport>,
}

/// In-memory result of a processing run
#[derive(Debug, Clone)]
pub struct SessionArtifacts {
    pub metadata: SessionMetadata,
    pub vehicles: BTreeMap<VehicleId, VehicleRun>,
    pub references: TrackReferences,
    pub sector_map: Option<SectorMap>,
    pub sector_timeline: Option<SectorTimeline>,
    /// Trail over the end of each vehicle's fastest lap against the canonical line
    pub trails: BTreeMap<VehicleId, Vec<DeltaTrailSegment>>,
}

struct Anchor {
    vehicle_id: VehicleId,
    point: GeoPoint,
    direction: Option<f64>,
}

struct VehicleAnalysis {
    vehicle_id: VehicleId,
    events: Option<Vec<SectorEvent>>,
    trail: Option<Vec<DeltaTrailSegment>>,
    warnings: Vec<VehicleWarning>,
}

pub struct Pipeline<'a> {
    context: &'a ProcessingContext,
}

impl<'a> Pipeline<'a> {
    pub fn new(context: &'a ProcessingContext) -> Self {
        Self { context }
    }

    /// Validate, load and process a telemetry CSV
    pub fn process_file(&self, input: &Path) -> Result<SessionArtifacts, LaptraceError> {
        let schema = validate_schema(input)?;
        info!(
            "Pre-flight check passed: {} rows, {} vehicles, {} channels",
            schema.rows,
            schema.vehicles.len(),
            schema.channels.len()
        );
        self.context.cancel.check()?;
        let batch = load_telemetry(input)?;
        self.run(&batch)
    }

    pub fn run(&self, batch: &TelemetryBatch) -> Result<SessionArtifacts, LaptraceError> {
        let config = &self.context.config;
        config.validate()?;
        let batch = if config.align_race_start {
            align_to_race_start(batch, config.speed_unit, config.lap_reset_threshold_m)
        } else {
            Cow::Borrowed(batch)
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.unwrap_or(0))
            .build()
            .map_err(|e| LaptraceError::WorkerPoolError { source: e })?;
        pool.install(|| self.run_in_pool(&batch))
    }

    fn run_in_pool(&self, batch: &TelemetryBatch) -> Result<SessionArtifacts, LaptraceError> {
        let config = &self.context.config;
        let cancel = &self.context.cancel;

        let anchor = choose_anchor(batch, config);
        let projector = match &anchor {
            Some(anchor) => {
                info!(
                    "Anchoring projection at {:.6}, {:.6} from vehicle {}",
                    anchor.point.lat, anchor.point.lon, anchor.vehicle_id
                );
                Some(LocalProjector::new(anchor.point)?)
            }
            None => {
                warn!("No valid GPS fix in the session");
                None
            }
        };
        let start_finish = anchor.as_ref().map(|anchor| StartFinishLine {
            point: Point2D::new(0.0, 0.0),
            radius_m: config.start_finish_radius_m,
            direction: anchor.direction,
        });

        let outcomes: Vec<(VehicleReport, Option<VehicleRun>)> = batch
            .vehicles
            .par_iter()
            .map(|(_, channels)| self.process_vehicle(channels, projector.as_ref(), start_finish))
            .collect::<Result<_, _>>()?;
        cancel.check()?;

        let mut reports: BTreeMap<VehicleId, VehicleReport> = BTreeMap::new();
        let mut runs: BTreeMap<VehicleId, VehicleRun> = BTreeMap::new();
        for (report, run) in outcomes {
            if let Some(run) = run {
                runs.insert(report.vehicle_id.clone(), run);
            }
            reports.insert(report.vehicle_id.clone(), report);
        }

        let references = self.build_references(&runs)?;
        cancel.check()?;

        let sector_map = self.sector_map(&runs, references.canonical.as_ref());
        let analyses: Vec<VehicleAnalysis> = runs
            .par_iter()
            .map(|(_, run)| {
                self.analyse_vehicle(run, references.canonical.as_ref(), sector_map.as_ref())
            })
            .collect::<Result<_, _>>()?;
        cancel.check()?;

        let mut streams = Vec::with_capacity(analyses.len());
        let mut trails = BTreeMap::new();
        for analysis in analyses {
            if let Some(report) = reports.get_mut(&analysis.vehicle_id) {
                report.warnings.extend(analysis.warnings);
            }
            if let Some(events) = analysis.events {
                streams.push(events);
            }
            if let Some(trail) = analysis.trail {
                trails.insert(analysis.vehicle_id, trail);
            }
        }
        let sector_timeline = sector_map
            .as_ref()
            .map(|map| SectorTimeline::merge(map.len(), streams));

        let metadata = self.metadata(
            batch,
            anchor.as_ref(),
            &runs,
            &references,
            sector_map.as_ref(),
            reports.into_values().collect(),
        );
        info!(
            "Processed session: {} of {} vehicles included, {:.1}s",
            metadata.vehicle_ids.len(),
            metadata.vehicles.len(),
            metadata.duration_s
        );
        Ok(SessionArtifacts {
            metadata,
            vehicles: runs,
            references,
            sector_map,
            sector_timeline,
            trails,
        })
    }

    /// Projection, resampling and segmentation of one vehicle
    fn process_vehicle(
        &self,
        channels: &VehicleChannels,
        projector: Option<&LocalProjector>,
        start_finish: Option<StartFinishLine>,
    ) -> Result<(VehicleReport, Option<VehicleRun>), LaptraceError> {
        self.context.cancel.check()?;
        let config = &self.context.config;
        let mut report = VehicleReport::new(&channels.vehicle_id);

        let (Some(latitudes), Some(longitudes), Some(projector)) = (
            channels.series(Channel::Latitude),
            channels.series(Channel::Longitude),
            projector,
        ) else {
            let channel = if channels.has(Channel::Latitude) {
                Channel::Longitude
            } else {
                Channel::Latitude
            };
            return Ok(report.excluded(VehicleWarning::InsufficientChannelData { channel }));
        };

        let fixes = pair_fixes(latitudes, longitudes, config.gap_tolerance_s);
        let (positions, invalid) = projector.project_fixes(&fixes);
        if invalid > 0 {
            warn!(
                "Dropped {} invalid GPS fixes for vehicle {}",
                invalid, channels.vehicle_id
            );
            report
                .warnings
                .push(VehicleWarning::InvalidCoordinates { count: invalid });
        }

        let resampler = ChannelResampler::new(config.resampler());
        let trajectory = match resampler.resample(channels, &positions) {
            Ok(trajectory) => trajectory,
            Err(LaptraceError::InsufficientChannelData { channel, .. }) => {
                return Ok(report.excluded(VehicleWarning::InsufficientChannelData { channel }));
            }
            Err(e) => return Err(e),
        };
        report.warnings.extend(
            trajectory
                .missing_channels
                .iter()
                .map(|channel| VehicleWarning::MissingChannel { channel: *channel }),
        );
        report.warnings.extend(
            trajectory
                .partial_channels
                .iter()
                .map(|channel| VehicleWarning::PartialChannel { channel: *channel }),
        );
        if trajectory.lap_distance.is_none() {
            report.warnings.push(VehicleWarning::NoLapDistance);
        }

        let mut segmenter = config.segmenter();
        segmenter.start_finish = start_finish;
        let laps = LapSegmenter::new(segmenter).segment(&trajectory);
        let best = fastest_lap(&laps);
        if best.is_none() {
            report.warnings.push(VehicleWarning::NoCompleteLap);
        }
        let reference_laps = reference_laps(
            &laps,
            &positions,
            channels.lap_span(1),
            &config.reference_filter,
        );
        if best.is_some() && reference_laps.is_empty() {
            info!(
                "Vehicle {} has no lap fit for the racing lines",
                channels.vehicle_id
            );
        }
        report.included = true;
        report.rows = trajectory.len();
        report.laps = laps.len();
        report.complete_laps = laps.iter().filter(|lap| lap.complete).count();
        report.best_lap_s = best.map(LapRecord::duration);
        debug!(
            "Vehicle {} has {} laps, {} complete",
            report.vehicle_id, report.laps, report.complete_laps
        );
        Ok((
            report,
            Some(VehicleRun {
                trajectory,
                laps,
                reference_laps,
            }),
        ))
    }

    /// Barrier stage: every racing line and its index
    fn build_references(
        &self,
        runs: &BTreeMap<VehicleId, VehicleRun>,
    ) -> Result<TrackReferences, LaptraceError> {
        let config = &self.context.config;
        let builder = RacingLineBuilder::new(config.racing_line_points);
        let sources = runs.values().map(VehicleRun::source).collect_vec();

        let global_best = match builder.build_global_best(&sources) {
            Ok(line) => Some(TrackReference::new(line)),
            Err(LaptraceError::NoCompleteLap) => {
                warn!("No vehicle completed a full lap, racing lines and delta trails are skipped");
                return Ok(TrackReferences::default());
            }
            Err(e) => return Err(e),
        };

        let per_car_lines: Vec<RacingLine> = sources
            .par_iter()
            .filter_map(|source| builder.build_per_car(*source).ok())
            .collect();
        info!("Built {} per-car racing lines", per_car_lines.len());
        let outliers = match config.reference_filter.outlier_z_score {
            Some(z_threshold) => {
                let median_lap_times = runs
                    .iter()
                    .filter_map(|(vehicle_id, run)| {
                        Some((vehicle_id.clone(), run.median_lap_time()?))
                    })
                    .collect();
                outlier_vehicles(&median_lap_times, z_threshold)
            }
            None => BTreeSet::new(),
        };
        let consensus_lines = per_car_lines
            .iter()
            .filter(|line| match &line.kind {
                RacingLineKind::PerCar(vehicle_id) => !outliers.contains(vehicle_id),
                _ => true,
            })
            .cloned()
            .collect_vec();
        let canonical = if consensus_lines.is_empty() {
            builder.build_canonical(&per_car_lines)?
        } else {
            if !outliers.is_empty() {
                warn!("Leaving outlier vehicles {outliers:?} out of the canonical line");
            }
            builder.build_canonical(&consensus_lines)?
        };
        info!(
            "Built canonical racing line: {:.1}m, ideal lap {:.2}s",
            canonical.track_length,
            canonical.ideal_lap_time()
        );

        let per_car = if config.per_car_racing_lines {
            per_car_lines
                .into_par_iter()
                .filter_map(|line| {
                    let RacingLineKind::PerCar(vehicle_id) = line.kind.clone() else {
                        return None;
                    };
                    Some((vehicle_id, TrackReference::new(line)))
                })
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(TrackReferences {
            canonical: Some(TrackReference::new(canonical)),
            global_best,
            per_car,
        })
    }

    fn sector_map(
        &self,
        runs: &BTreeMap<VehicleId, VehicleRun>,
        canonical: Option<&TrackReference>,
    ) -> Option<SectorMap> {
        let config = &self.context.config;
        if config.sector_boundaries_m.is_none() && config.sector_count.is_none() {
            warn!("{}, sector timing is disabled", LaptraceError::MissingSectorMap);
            return None;
        }
        let Some(track_length) = measured_track_length(runs)
            .or_else(|| canonical.map(|reference| reference.line.track_length))
        else {
            warn!("Track length is unknown, sector timing is disabled");
            return None;
        };
        let map = match (&config.sector_boundaries_m, config.sector_count) {
            (Some(boundaries), _) => SectorMap::new(track_length, boundaries),
            (None, Some(count)) => SectorMap::equal(track_length, count),
            (None, None) => return None,
        };
        match map {
            Ok(map) => {
                info!(
                    "Using {} sectors over a {:.1}m lap",
                    map.len(),
                    map.track_length_m
                );
                Some(map)
            }
            Err(e) => {
                warn!("{}, sector timing is disabled", e);
                None
            }
        }
    }

    /// Sector events and the default delta trail of one vehicle
    fn analyse_vehicle(
        &self,
        run: &VehicleRun,
        canonical: Option<&TrackReference>,
        sector_map: Option<&SectorMap>,
    ) -> Result<VehicleAnalysis, LaptraceError> {
        self.context.cancel.check()?;
        let config = &self.context.config;
        let trajectory = &run.trajectory;
        let mut warnings = Vec::new();

        let events = match sector_map {
            Some(map) => {
                let distances: Option<Vec<Option<f64>>> =
                    match (&trajectory.lap_distance, canonical) {
                        (Some(distances), _) => Some(distances.clone()),
                        (None, Some(reference)) => Some(
                            trajectory
                                .rows
                                .iter()
                                .map(|row| {
                                    reference
                                        .locate(&row.position())
                                        .map(|located| located.arc_length)
                                })
                                .collect(),
                        ),
                        (None, None) => None,
                    };
                match distances {
                    Some(distances) => {
                        let mut engine = SectorTimingEngine::new(Some(map.clone()))?
                            .with_thresholds(
                                config.lap_reset_threshold_m,
                                config.start_line_tolerance_m,
                            )
                            .with_min_lap_duration(config.min_lap_duration_s);
                        // Laps roll over where the segmenter put them, not on distance noise
                        let mut lap_starts =
                            run.laps.iter().skip(1).map(|lap| lap.start_index).peekable();
                        let mut lap_start = false;
                        let mut events = Vec::new();
                        for (index, (row, distance)) in
                            trajectory.rows.iter().zip(distances).enumerate()
                        {
                            lap_start |= lap_starts.next_if_eq(&index).is_some();
                            // Nothing to time before the first known distance
                            let Some(distance) = distance else {
                                continue;
                            };
                            events.extend(engine.update_with_boundary(
                                &trajectory.vehicle_id,
                                row.t,
                                distance,
                                std::mem::take(&mut lap_start),
                            ));
                        }
                        debug!(
                            "Vehicle {} produced {} sector events",
                            trajectory.vehicle_id,
                            events.len()
                        );
                        Some(events)
                    }
                    None => {
                        warnings.push(VehicleWarning::SectorTimingUnavailable);
                        None
                    }
                }
            }
            None => None,
        };

        let trail = match (canonical, fastest_lap(&run.laps)) {
            (Some(reference), Some(lap)) if lap.end_index > lap.start_index => {
                let end_time = trajectory.rows[lap.end_index - 1].t;
                Some(DeltaTrailGenerator::new(reference).generate(
                    trajectory,
                    &run.laps,
                    TrailWindow {
                        end_time,
                        duration_s: config.trail_window_s,
                    },
                ))
            }
            _ => None,
        };

        Ok(VehicleAnalysis {
            vehicle_id: trajectory.vehicle_id.clone(),
            events,
            trail,
            warnings,
        })
    }

    fn metadata(
        &self,
        batch: &TelemetryBatch,
        anchor: Option<&Anchor>,
        runs: &BTreeMap<VehicleId, VehicleRun>,
        references: &TrackReferences,
        sector_map: Option<&SectorMap>,
        vehicles: Vec<VehicleReport>,
    ) -> SessionMetadata {
        let config = &self.context.config;
        let mut bounds = BoundingBox::new();
        for run in runs.values() {
            bounds.merge(&run.trajectory.bounds());
        }
        let start = runs
            .values()
            .map(|run| run.trajectory.start_time())
            .fold(f64::INFINITY, f64::min);
        let end = runs
            .values()
            .map(|run| run.trajectory.end_time())
            .fold(f64::NEG_INFINITY, f64::max);

        SessionMetadata {
            bounds,
            duration_s: if runs.is_empty() { 0.0 } else { end - start },
            sample_step_s: config.sample_step_s(),
            time_origin: batch.time_origin,
            anchor: anchor.map(|anchor| anchor.point),
            vehicle_ids: runs.keys().cloned().collect(),
            colors: assign_colors(runs.keys()),
            per_car_racing_lines: !references.per_car.is_empty(),
            separate_brake_channels: !runs.is_empty()
                && runs
                    .values()
                    .all(|run| run.trajectory.separate_brake_channels),
            track_length_m: sector_map
                .map(|map| map.track_length_m)
                .or_else(|| references.canonical.as_ref().map(|c| c.line.track_length)),
            ideal_lap_time_s: references
                .canonical
                .as_ref()
                .map(|c| c.line.ideal_lap_time()),
            sector_timing: sector_map.is_some(),
            vehicles,
        }
    }
}

/// Validate, load, process and write a session in one go
pub fn process_session(
    input: &Path,
    output: &Path,
    context: &ProcessingContext,
) -> Result<SessionArtifacts, LaptraceError> {
    let artifacts = Pipeline::new(context).process_file(input)?;
    write_artifacts(output, &artifacts, &context.cancel)?;
    Ok(artifacts)
}

pub fn assign_colors<'v>(
    vehicle_ids: impl IntoIterator<Item = &'v VehicleId>,
) -> BTreeMap<VehicleId, [u8; 3]> {
    vehicle_ids
        .into_iter()
        .sorted()
        .enumerate()
        .map(|(i, vehicle_id)| (vehicle_id.clone(), VEHICLE_PALETTE[i % VEHICLE_PALETTE.len()]))
        .collect()
}

/// First valid fix of the configured reference lap, else of the lowest vehicle id
fn choose_anchor(batch: &TelemetryBatch, config: &PipelineConfig) -> Option<Anchor> {
    let fixes_of = |channels: &VehicleChannels| -> Vec<(f64, GeoPoint)> {
        match (
            channels.series(Channel::Latitude),
            channels.series(Channel::Longitude),
        ) {
            (Some(latitudes), Some(longitudes)) => {
                pair_fixes(latitudes, longitudes, config.gap_tolerance_s)
                    .into_iter()
                    .filter(|(_, fix)| fix.is_valid())
                    .collect()
            }
            _ => Vec::new(),
        }
    };

    if let Some(vehicle_id) = &config.reference_vehicle {
        let chosen = batch.vehicles.get(vehicle_id).and_then(|channels| {
            let fixes = fixes_of(channels);
            let from = match config.reference_lap {
                Some(lap) => channels.lap_span(lap)?.0,
                None => f64::NEG_INFINITY,
            };
            let first = fixes.iter().position(|(t, _)| *t >= from)?;
            anchor_from(vehicle_id, &fixes[first..])
        });
        if chosen.is_some() {
            return chosen;
        }
        warn!(
            "Reference lap {:?} of vehicle {} not found, anchoring on the first vehicle instead",
            config.reference_lap, vehicle_id
        );
    }

    batch
        .vehicles
        .values()
        .find_map(|channels| anchor_from(&channels.vehicle_id, &fixes_of(channels)))
}

fn anchor_from(vehicle_id: &str, fixes: &[(f64, GeoPoint)]) -> Option<Anchor> {
    let point = fixes.first()?.1;
    let projector = LocalProjector::new(point).ok()?;
    let origin = Point2D::new(0.0, 0.0);
    let direction = fixes.iter().skip(1).find_map(|(_, fix)| {
        let position = projector.project(*fix).ok()?;
        (position.distance(&origin) >= ANCHOR_DIRECTION_MIN_M)
            .then(|| origin.heading_to(&position))
    });
    Some(Anchor {
        vehicle_id: vehicle_id.to_string(),
        point,
        direction,
    })
}

/// Median lap-distance span of every complete lap with lap distance
fn measured_track_length(runs: &BTreeMap<VehicleId, VehicleRun>) -> Option<f64> {
    let spans = runs
        .values()
        .flat_map(|run| {
            let distances = run.trajectory.lap_distance.as_deref();
            run.laps
                .iter()
                .filter(|lap| lap.complete)
                .filter_map(move |lap| {
                    let (min, max) = distances?[lap.rows()]
                        .iter()
                        .flatten()
                        .copied()
                        .minmax()
                        .into_option()?;
                    Some(max - min)
                })
        })
        .filter(|span| *span > 0.0)
        .collect_vec();
    median(spans)
}

fn median(values: Vec<f64>) -> Option<f64> {
    let sorted = values.into_iter().sorted_by(f64::total_cmp).collect_vec();
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    })
}
