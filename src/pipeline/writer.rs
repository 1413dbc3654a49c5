// Artifact writer: everything lands in a staging directory that is renamed into place

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::errors::LaptraceError;
use crate::track::RacingLine;

use super::{CancellationToken, SessionArtifacts};

pub const METADATA_FILE: &str = "metadata.json";
pub const LAPS_FILE: &str = "laps.jsonl";
pub const RACING_LINE_FILE: &str = "racing_line.csv";
pub const CANONICAL_LINE_FILE: &str = "canonical_line.csv";
pub const SPEED_PROFILE_FILE: &str = "speed_profile.csv";
pub const SECTOR_MAP_FILE: &str = "sector_map.json";
pub const SECTOR_EVENTS_FILE: &str = "sector_events.jsonl";
pub const TRAJECTORIES_DIR: &str = "trajectories";
pub const RACING_LINES_DIR: &str = "racing_lines";
pub const TRAILS_DIR: &str = "trails";

#[derive(Serialize)]
struct LinePointRecord {
    dist_m: f64,
    x_m: f64,
    y_m: f64,
    curvature: f64,
}

#[derive(Serialize)]
struct SpeedProfileRecord {
    dist_m: f64,
    ref_speed_ms: f64,
    ideal_speed_ms: f64,
}

#[derive(Serialize)]
struct TrailRecord<'a> {
    vehicle_id: &'a str,
    timestamp: f64,
    t_rel: f64,
    x: f64,
    y: f64,
    delta_speed: f64,
}

/// Writes one run's artifacts.
///
/// Nothing is visible at the output path until [`ArtifactWriter::commit`]; a
/// writer dropped without committing removes its staging directory.
pub struct ArtifactWriter {
    output_dir: PathBuf,
    staging_dir: PathBuf,
    committed: bool,
}

impl ArtifactWriter {
    pub fn new(output_dir: &Path) -> Result<Self, LaptraceError> {
        let name = output_dir.file_name().ok_or_else(|| LaptraceError::WriterError {
            path: output_dir.display().to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "output path has no name"),
        })?;
        let staging_dir =
            output_dir.with_file_name(format!(".{}.staging", name.to_string_lossy()));
        if staging_dir.exists() {
            debug!("Removing stale staging directory {:?}", staging_dir);
            fs::remove_dir_all(&staging_dir).map_err(|e| writer_error(&staging_dir, e))?;
        }
        for dir in [TRAJECTORIES_DIR, RACING_LINES_DIR, TRAILS_DIR] {
            let path = staging_dir.join(dir);
            fs::create_dir_all(&path).map_err(|e| writer_error(&path, e))?;
        }
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            staging_dir,
            committed: false,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Write every artifact into the staging directory, checking for cancellation between vehicles
    pub fn write(
        &self,
        artifacts: &SessionArtifacts,
        cancel: &CancellationToken,
    ) -> Result<(), LaptraceError> {
        self.write_json(METADATA_FILE, &artifacts.metadata)?;

        for (vehicle_id, run) in &artifacts.vehicles {
            cancel.check()?;
            let path = self.vehicle_path(TRAJECTORIES_DIR, vehicle_id);
            self.write_table(&path, run.trajectory.rows.iter())?;
        }
        self.write_json_lines(
            LAPS_FILE,
            artifacts.vehicles.values().flat_map(|run| run.laps.iter()),
        )?;

        let references = &artifacts.references;
        if let Some(global_best) = &references.global_best {
            self.write_line(&self.staging_dir.join(RACING_LINE_FILE), &global_best.line)?;
        }
        for (vehicle_id, reference) in &references.per_car {
            cancel.check()?;
            self.write_line(
                &self.vehicle_path(RACING_LINES_DIR, vehicle_id),
                &reference.line,
            )?;
        }
        if let Some(canonical) = &references.canonical {
            let line = &canonical.line;
            self.write_line(&self.staging_dir.join(CANONICAL_LINE_FILE), line)?;
            let ideal = line.ideal_speeds();
            let profile = line
                .arc_lengths
                .iter()
                .zip(line.speed_profile.speeds())
                .zip(ideal)
                .map(|((dist_m, ref_speed_ms), ideal_speed_ms)| SpeedProfileRecord {
                    dist_m: *dist_m,
                    ref_speed_ms: *ref_speed_ms,
                    ideal_speed_ms,
                });
            self.write_table(&self.staging_dir.join(SPEED_PROFILE_FILE), profile)?;
        }

        for (vehicle_id, trail) in &artifacts.trails {
            cancel.check()?;
            let records = trail.iter().map(|segment| TrailRecord {
                vehicle_id: &segment.vehicle_id,
                timestamp: segment.timestamp,
                t_rel: segment.t_rel,
                x: segment.x,
                y: segment.y,
                delta_speed: segment.delta_speed,
            });
            self.write_table(&self.vehicle_path(TRAILS_DIR, vehicle_id), records)?;
        }

        if let Some(map) = &artifacts.sector_map {
            self.write_json(SECTOR_MAP_FILE, map)?;
        }
        if let Some(timeline) = &artifacts.sector_timeline {
            self.write_json_lines(SECTOR_EVENTS_FILE, timeline.events())?;
        }
        Ok(())
    }

    /// Replace the output directory with the staged artifacts
    pub fn commit(&mut self) -> Result<PathBuf, LaptraceError> {
        if self.output_dir.exists() {
            fs::remove_dir_all(&self.output_dir).map_err(|e| writer_error(&self.output_dir, e))?;
        }
        fs::rename(&self.staging_dir, &self.output_dir)
            .map_err(|e| writer_error(&self.output_dir, e))?;
        self.committed = true;
        info!("Artifacts written to {:?}", self.output_dir);
        Ok(self.output_dir.clone())
    }

    fn vehicle_path(&self, dir: &str, vehicle_id: &str) -> PathBuf {
        self.staging_dir
            .join(dir)
            .join(format!("{}.csv", file_stem(vehicle_id)))
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), LaptraceError> {
        let path = self.staging_dir.join(name);
        let file = File::create(&path).map_err(|e| writer_error(&path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)
            .map_err(|e| LaptraceError::ArtifactSerializeError { source: e })?;
        writer.flush().map_err(|e| writer_error(&path, e))
    }

    fn write_json_lines<T: Serialize>(
        &self,
        name: &str,
        items: impl IntoIterator<Item = T>,
    ) -> Result<(), LaptraceError> {
        let path = self.staging_dir.join(name);
        serde_jsonlines::write_json_lines(&path, items).map_err(|e| writer_error(&path, e))
    }

    fn write_table<T: Serialize>(
        &self,
        path: &Path,
        records: impl IntoIterator<Item = T>,
    ) -> Result<(), LaptraceError> {
        let table_error = |e: csv::Error| LaptraceError::TableWriterError {
            path: path.display().to_string(),
            source: e,
        };
        let mut writer = csv::Writer::from_path(path).map_err(table_error)?;
        for record in records {
            writer.serialize(record).map_err(table_error)?;
        }
        writer.flush().map_err(|e| writer_error(path, e))
    }

    fn write_line(&self, path: &Path, line: &RacingLine) -> Result<(), LaptraceError> {
        let records = line
            .points
            .iter()
            .zip(&line.arc_lengths)
            .zip(&line.curvature)
            .map(|((point, dist_m), curvature)| LinePointRecord {
                dist_m: *dist_m,
                x_m: point.x,
                y_m: point.y,
                curvature: *curvature,
            });
        self.write_table(path, records)
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.staging_dir) {
            warn!(
                "Could not remove staging directory {:?}: {}",
                self.staging_dir, e
            );
        } else {
            debug!("Discarded staging directory {:?}", self.staging_dir);
        }
    }
}

/// Write and commit artifacts; on any failure the output directory is left untouched
pub fn write_artifacts(
    output_dir: &Path,
    artifacts: &SessionArtifacts,
    cancel: &CancellationToken,
) -> Result<PathBuf, LaptraceError> {
    let mut writer = ArtifactWriter::new(output_dir)?;
    writer.write(artifacts, cancel)?;
    cancel.check()?;
    writer.commit()
}

/// File name for a vehicle id, keeping only characters safe on every filesystem
pub fn file_stem(vehicle_id: &str) -> String {
    vehicle_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn writer_error(path: &Path, source: io::Error) -> LaptraceError {
    LaptraceError::WriterError {
        path: path.display().to_string(),
        source,
    }
}
