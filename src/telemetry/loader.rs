// Long-format telemetry CSV loader with pre-flight schema validation

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use log::{debug, info};

use crate::errors::LaptraceError;

use super::{Channel, TelemetryBatch, TelemetrySample, VehicleChannels};

pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const VEHICLE_COLUMN: &str = "vehicle_id";
pub const LAP_COLUMN: &str = "lap";
pub const NAME_COLUMN: &str = "telemetry_name";
pub const VALUE_COLUMN: &str = "telemetry_value";

const REQUIRED_COLUMNS: [&str; 5] = [
    TIMESTAMP_COLUMN,
    VEHICLE_COLUMN,
    LAP_COLUMN,
    NAME_COLUMN,
    VALUE_COLUMN,
];

/// Summary produced by the pre-flight validation pass
#[derive(Debug, Clone, Default)]
pub struct SchemaReport {
    pub rows: usize,
    pub vehicles: BTreeSet<String>,
    pub channels: BTreeSet<Channel>,
    /// Channel names present in the file but not used by the pipeline
    pub unknown_channels: BTreeSet<String>,
}

struct ColumnIndex {
    timestamp: usize,
    vehicle_id: usize,
    lap: usize,
    name: usize,
    value: usize,
}

impl ColumnIndex {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, LaptraceError> {
        let position: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim(), i))
            .collect();
        let find = |column: &str| {
            position
                .get(column)
                .copied()
                .ok_or_else(|| LaptraceError::MalformedInputSchema {
                    column: column.to_string(),
                    row: 1,
                    reason: "required column missing from header".to_string(),
                })
        };
        for column in REQUIRED_COLUMNS {
            find(column)?;
        }
        Ok(Self {
            timestamp: find(TIMESTAMP_COLUMN)?,
            vehicle_id: find(VEHICLE_COLUMN)?,
            lap: find(LAP_COLUMN)?,
            name: find(NAME_COLUMN)?,
            value: find(VALUE_COLUMN)?,
        })
    }
}

/// Outcome of parsing one data row
enum ParsedRow {
    Sample(TelemetrySample),
    Unknown { vehicle_id: String, name: String },
}

/// Parse a timestamp given as seconds, RFC 3339 or `YYYY-MM-DD HH:MM:SS[.fff]`, into seconds
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<f64>() {
        return seconds.is_finite().then_some(seconds);
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(raw) {
        return Some(datetime.timestamp_micros() as f64 / 1e6);
    }
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc().timestamp_micros() as f64 / 1e6);
        }
    }
    None
}

fn malformed(column: &str, row: usize, reason: String) -> LaptraceError {
    LaptraceError::MalformedInputSchema {
        column: column.to_string(),
        row,
        reason,
    }
}

fn parse_row(
    record: &csv::StringRecord,
    columns: &ColumnIndex,
    row: usize,
) -> Result<ParsedRow, LaptraceError> {
    let field = |index: usize| record.get(index).unwrap_or("").trim();

    let raw_timestamp = field(columns.timestamp);
    let timestamp = parse_timestamp(raw_timestamp).ok_or_else(|| {
        malformed(
            TIMESTAMP_COLUMN,
            row,
            format!("'{raw_timestamp}' is not a timestamp"),
        )
    })?;

    let vehicle_id = field(columns.vehicle_id);
    if vehicle_id.is_empty() {
        return Err(malformed(VEHICLE_COLUMN, row, "empty vehicle id".to_string()));
    }

    let raw_lap = field(columns.lap);
    let lap = if raw_lap.is_empty() {
        None
    } else {
        let lap = raw_lap
            .parse::<f64>()
            .ok()
            .filter(|l| l.is_finite())
            .ok_or_else(|| malformed(LAP_COLUMN, row, format!("'{raw_lap}' is not numeric")))?;
        // Loggers emit negative or fractional counters on resets; keep only whole laps
        (lap >= 0.0 && lap.fract() == 0.0 && lap <= u32::MAX as f64).then_some(lap as u32)
    };

    let raw_value = field(columns.value);
    let value = raw_value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| malformed(VALUE_COLUMN, row, format!("'{raw_value}' is not numeric")))?;

    let name = field(columns.name);
    Ok(match Channel::from_telemetry_name(name) {
        Some(channel) => ParsedRow::Sample(TelemetrySample {
            vehicle_id: vehicle_id.to_string(),
            timestamp,
            lap,
            channel,
            value,
        }),
        None => ParsedRow::Unknown {
            vehicle_id: vehicle_id.to_string(),
            name: name.to_string(),
        },
    })
}

/// Walk every record of the input, handing each parsed row to `visit`.
/// The first schema violation aborts the walk.
fn walk_rows<R: Read>(
    reader: R,
    mut visit: impl FnMut(ParsedRow),
) -> Result<usize, LaptraceError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = csv_reader
        .headers()
        .map_err(|e| LaptraceError::CsvError { source: e })?
        .clone();
    let columns = ColumnIndex::from_headers(&headers)?;

    let mut rows = 0;
    let mut record = csv::StringRecord::new();
    loop {
        let has_record = csv_reader
            .read_record(&mut record)
            .map_err(|e| LaptraceError::CsvError { source: e })?;
        if !has_record {
            break;
        }
        // Row numbers are 1-based file lines, the header being row 1
        let row = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(rows + 2);
        visit(parse_row(&record, &columns, row)?);
        rows += 1;
    }
    Ok(rows)
}

/// Pre-flight pass: validate columns and numeric fields without retaining samples
pub fn validate_schema(path: &Path) -> Result<SchemaReport, LaptraceError> {
    let file = File::open(path).map_err(|e| LaptraceError::TelemetryReadError { source: e })?;
    let mut report = SchemaReport::default();
    report.rows = walk_rows(file, |parsed| match parsed {
        ParsedRow::Sample(sample) => {
            report.channels.insert(sample.channel);
            report.vehicles.insert(sample.vehicle_id);
        }
        ParsedRow::Unknown { vehicle_id, name } => {
            report.vehicles.insert(vehicle_id);
            report.unknown_channels.insert(name);
        }
    })?;
    info!(
        "Validated {} rows for {} vehicles",
        report.rows,
        report.vehicles.len()
    );
    Ok(report)
}

pub fn load_telemetry(path: &Path) -> Result<TelemetryBatch, LaptraceError> {
    let file = File::open(path).map_err(|e| LaptraceError::TelemetryReadError { source: e })?;
    read_telemetry(file)
}

/// Read a whole session, grouping samples by vehicle and channel.
///
/// Timestamps are rebased on the earliest sample of the session. Duplicate
/// samples for the same (vehicle, channel, timestamp) keep the last value read.
pub fn read_telemetry<R: Read>(reader: R) -> Result<TelemetryBatch, LaptraceError> {
    let mut raw: BTreeMap<String, VehicleChannels> = BTreeMap::new();
    let mut unknown: BTreeMap<String, usize> = BTreeMap::new();
    let mut time_origin = f64::INFINITY;

    let rows = walk_rows(reader, |parsed| match parsed {
        ParsedRow::Sample(sample) => {
            time_origin = time_origin.min(sample.timestamp);
            let vehicle = raw
                .entry(sample.vehicle_id.clone())
                .or_insert_with(|| VehicleChannels::new(sample.vehicle_id.clone()));
            if let Some(lap) = sample.lap {
                let span = vehicle
                    .lap_spans
                    .entry(lap)
                    .or_insert((sample.timestamp, sample.timestamp));
                span.0 = span.0.min(sample.timestamp);
                span.1 = span.1.max(sample.timestamp);
            }
            vehicle
                .series
                .entry(sample.channel)
                .or_default()
                .push((sample.timestamp, sample.value));
        }
        ParsedRow::Unknown { vehicle_id, name } => {
            raw.entry(vehicle_id.clone())
                .or_insert_with(|| VehicleChannels::new(vehicle_id));
            *unknown.entry(name).or_default() += 1;
        }
    })?;

    for (name, count) in &unknown {
        debug!("Ignoring {count} samples of unused channel {name}");
    }

    if !time_origin.is_finite() {
        time_origin = 0.0;
    }
    for vehicle in raw.values_mut() {
        for series in vehicle.series.values_mut() {
            for sample in series.iter_mut() {
                sample.0 -= time_origin;
            }
            collapse_duplicates(series);
        }
        for span in vehicle.lap_spans.values_mut() {
            span.0 -= time_origin;
            span.1 -= time_origin;
        }
    }

    info!("Loaded {} rows for {} vehicles", rows, raw.len());
    Ok(TelemetryBatch {
        vehicles: raw,
        time_origin,
        row_count: rows,
    })
}

/// Sort by time and collapse equal timestamps, last write wins
fn collapse_duplicates(series: &mut Vec<(f64, f64)>) {
    // Stable sort keeps arrival order among equal timestamps
    series.sort_by(|a, b| a.0.total_cmp(&b.0));
    series.dedup_by(|later, kept| {
        if later.0 == kept.0 {
            kept.1 = later.1;
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "timestamp,vehicle_id,lap,telemetry_name,telemetry_value";

    fn read(body: &str) -> Result<TelemetryBatch, LaptraceError> {
        read_telemetry(format!("{HEADER}\n{body}").as_bytes())
    }

    #[test]
    fn test_groups_by_vehicle_and_channel() {
        let batch = read(
            "10.0,GR86-002,1,speed,100\n\
             10.1,GR86-002,1,speed,101\n\
             10.0,GR86-004,1,speed,90\n\
             10.0,GR86-002,1,aps,55\n",
        )
        .unwrap();
        assert_eq!(batch.row_count, 4);
        assert_eq!(batch.vehicles.len(), 2);
        assert_eq!(batch.time_origin, 10.0);
        let car = &batch.vehicles["GR86-002"];
        assert_eq!(car.series(Channel::Speed).unwrap().len(), 2);
        assert_eq!(car.series(Channel::Throttle).unwrap(), &[(0.0, 55.0)]);
    }

    #[test]
    fn test_duplicates_last_write_wins() {
        let batch = read(
            "1.2,car,1,speed,20\n\
             1.0,car,1,speed,10\n\
             1.2,car,1,speed,25\n",
        )
        .unwrap();
        let speed = batch.vehicles["car"].series(Channel::Speed).unwrap();
        assert_eq!(speed.len(), 2);
        assert_eq!(speed[0].1, 10.0);
        assert_eq!(speed[1].1, 25.0);
    }

    #[test]
    fn test_missing_column_is_reported() {
        let result = read_telemetry("timestamp,vehicle_id,telemetry_name,telemetry_value\n".as_bytes());
        match result {
            Err(LaptraceError::MalformedInputSchema { column, row, .. }) => {
                assert_eq!(column, "lap");
                assert_eq!(row, 1);
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_value_reports_row() {
        let result = read(
            "1.0,car,1,speed,20\n\
             1.1,car,1,speed,fast\n",
        );
        match result {
            Err(LaptraceError::MalformedInputSchema { column, row, .. }) => {
                assert_eq!(column, "telemetry_value");
                assert_eq!(row, 3);
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_lap_is_rejected() {
        let result = read("1.0,car,one,speed,20\n");
        assert!(matches!(
            result,
            Err(LaptraceError::MalformedInputSchema { ref column, .. }) if column == "lap"
        ));
    }

    #[test]
    fn test_unknown_channels_are_ignored() {
        let batch = read("1.0,car,1,ath,20\n1.0,car,1,speed,20\n").unwrap();
        let car = &batch.vehicles["car"];
        assert_eq!(car.series.len(), 1);
    }

    #[test]
    fn test_lap_spans() {
        let batch = read(
            "100.0,car,3,speed,20\n\
             101.0,car,3,speed,20\n\
             102.0,car,4,speed,20\n\
             102.5,car,,speed,20\n",
        )
        .unwrap();
        let car = &batch.vehicles["car"];
        assert_eq!(car.lap_span(3), Some((0.0, 1.0)));
        assert_eq!(car.lap_span(4), Some((2.0, 2.0)));
        assert_eq!(car.lap_span(5), None);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("12.5"), Some(12.5));
        let rfc = parse_timestamp("2025-04-04T18:10:23.500Z").unwrap();
        let naive = parse_timestamp("2025-04-04 18:10:23.500").unwrap();
        assert!((rfc - naive).abs() < 1e-6);
        let whole = parse_timestamp("2025-04-04 18:10:23").unwrap();
        assert!((naive - whole - 0.5).abs() < 1e-6);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("NaN"), None);
    }

    #[test]
    fn test_validate_schema_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER},extra").unwrap();
        writeln!(file, "2025-04-04T18:10:23.000Z,GR86-002,1,speed,100,x").unwrap();
        writeln!(file, "2025-04-04T18:10:23.010Z,GR86-002,1,nmot,4000,x").unwrap();
        writeln!(file, "2025-04-04T18:10:23.010Z,GR86-004,1,ath,4,x").unwrap();

        let report = validate_schema(file.path()).unwrap();
        assert_eq!(report.rows, 3);
        assert_eq!(report.vehicles.len(), 2);
        assert!(report.channels.contains(&Channel::Rpm));
        assert!(report.unknown_channels.contains("ath"));
    }
}
