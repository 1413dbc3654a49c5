// Error types for laptrace

use crate::telemetry::Channel;
use snafu::Snafu;
use std::io;

#[derive(Debug, Snafu)]
pub enum LaptraceError {
    // Errors for the telemetry loader
    #[snafu(display("Malformed input at row {row}, column '{column}': {reason}"))]
    MalformedInputSchema {
        column: String,
        row: usize,
        reason: String,
    },
    #[snafu(display("Error reading telemetry file"))]
    TelemetryReadError { source: io::Error },
    #[snafu(display("Error parsing telemetry CSV"))]
    CsvError { source: csv::Error },

    // Errors raised by pipeline stages
    #[snafu(display("Invalid GPS coordinate lat={lat}, lon={lon}"))]
    InvalidCoordinate { lat: f64, lon: f64 },
    #[snafu(display("Vehicle {vehicle_id} has no usable {channel} data"))]
    InsufficientChannelData { vehicle_id: String, channel: Channel },
    #[snafu(display("No vehicle completed a full lap"))]
    NoCompleteLap,
    #[snafu(display("No sector boundary map supplied for this track"))]
    MissingSectorMap,
    #[snafu(display("Invalid sector map: {reason}"))]
    InvalidSectorMap { reason: String },
    #[snafu(display("Processing run cancelled"))]
    Cancelled,
    #[snafu(display("Could not build worker pool"))]
    WorkerPoolError { source: rayon::ThreadPoolBuildError },

    // Errors for replay queries
    #[snafu(display("Unknown vehicle: {vehicle_id}"))]
    UnknownVehicle { vehicle_id: String },
    #[snafu(display("Racing line not available: {reference}"))]
    ReferenceUnavailable { reference: String },

    // Errors for the artifact writer
    #[snafu(display("Error writing artifact {path}"))]
    WriterError { path: String, source: io::Error },
    #[snafu(display("Error writing artifact table {path}"))]
    TableWriterError { path: String, source: csv::Error },
    #[snafu(display("Error serializing artifact"))]
    ArtifactSerializeError { source: serde_json::Error },

    // Config management errors
    #[snafu(display("Could not find application config directory"))]
    NoConfigDir,
    #[snafu(display("Error reading config file"))]
    ConfigIOError { source: io::Error },
    #[snafu(display("Error parsing config file"))]
    ConfigParseError { source: serde_json::Error },
    #[snafu(display("Invalid configuration: {field} - {reason}"))]
    InvalidConfig { field: String, reason: String },
}
