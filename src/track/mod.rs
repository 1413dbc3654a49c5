// Track-level references: racing lines, their spatial indices and sector timing

pub mod geometry;
pub mod racing_line;
pub mod sectors;
pub mod spatial_index;

pub use geometry::{BoundingBox, Point2D};
pub use racing_line::{
    LapRef, LapSource, LineSource, RacingLine, RacingLineBuilder, RacingLineKind, SpeedProfile,
    outlier_vehicles,
};
pub use sectors::{
    SectorBest, SectorBoundary, SectorEvent, SectorMap, SectorTimeline, SectorTimingEngine,
    SectorTimingSnapshot, SectorTimingState,
};
pub use spatial_index::{Neighbor, SpatialIndex};

/// A published racing line together with the index built from it
#[derive(Debug, Clone)]
pub struct TrackReference {
    pub line: RacingLine,
    pub index: SpatialIndex,
}

/// Where a position falls along a reference line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinePosition {
    pub nearest: Neighbor,
    /// Arc length refined onto the segments around the nearest point
    pub arc_length: f64,
}

impl TrackReference {
    pub fn new(line: RacingLine) -> Self {
        let index = SpatialIndex::build(&line);
        Self { line, index }
    }

    pub fn kind(&self) -> &RacingLineKind {
        &self.line.kind
    }

    pub fn locate(&self, position: &Point2D) -> Option<LinePosition> {
        let nearest = self.index.nearest(position)?;
        Some(LinePosition {
            nearest,
            arc_length: self.line.refine_arc_length(nearest.index, position),
        })
    }

    /// Reference speed at the line position closest to `position`
    pub fn reference_speed(&self, position: &Point2D) -> Option<f64> {
        self.locate(position)
            .map(|located| self.line.speed_profile.speed_at(located.arc_length))
    }
}
