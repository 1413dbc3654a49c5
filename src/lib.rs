// Library interface for laptrace
// The binary and the integration tests both go through these modules

pub mod analysis;
pub mod config;
pub mod errors;
pub mod laps;
pub mod pipeline;
pub mod replay;
pub mod telemetry;
pub mod track;

// Re-export commonly used types
pub use analysis::{DeltaTrailGenerator, DeltaTrailSegment, TrailWindow};
pub use config::{PipelineConfig, ReferenceFilter, SpeedUnit};
pub use errors::LaptraceError;
pub use laps::{LapRecord, LapSegmenter, SegmenterConfig, StartFinishLine};
pub use pipeline::{
    CancellationToken, Pipeline, ProcessingContext, SessionArtifacts, SessionMetadata,
    VehicleReport, VehicleWarning, process_session,
};
pub use replay::{ReplaySession, TrailQuery, TrailReference};
pub use telemetry::{Channel, TelemetryBatch, VehicleId, VehicleTrajectory};
pub use track::{
    RacingLine, RacingLineKind, SectorEvent, SectorMap, SectorTimingEngine, SectorTimingSnapshot,
    SpatialIndex, TrackReference,
};
