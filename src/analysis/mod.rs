pub mod delta_trail;

pub use delta_trail::{DeltaTrailGenerator, DeltaTrailSegment, TrailWindow};
