// Planar geometry shared by the projector, racing lines and trails

use serde::{Deserialize, Serialize};

/// A point in the local East-North-Up frame, in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_squared(&self, other: &Point2D) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn distance(&self, other: &Point2D) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Heading in radians (east = 0, counter-clockwise) of the segment from `self` to `to`
    pub fn heading_to(&self, to: &Point2D) -> f64 {
        (to.y - self.y).atan2(to.x - self.x)
    }

    pub fn lerp(&self, to: &Point2D, fraction: f64) -> Point2D {
        Point2D::new(
            self.x + (to.x - self.x) * fraction,
            self.y + (to.y - self.y) * fraction,
        )
    }
}

/// Bounding box for coordinate calculations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn new() -> Self {
        Self {
            x_min: f64::INFINITY,
            x_max: f64::NEG_INFINITY,
            y_min: f64::INFINITY,
            y_max: f64::NEG_INFINITY,
        }
    }

    pub fn update(&mut self, point: Point2D) {
        self.x_min = self.x_min.min(point.x);
        self.x_max = self.x_max.max(point.x);
        self.y_min = self.y_min.min(point.y);
        self.y_max = self.y_max.max(point.y);
    }

    pub fn merge(&mut self, other: &BoundingBox) {
        self.x_min = self.x_min.min(other.x_min);
        self.x_max = self.x_max.max(other.x_max);
        self.y_min = self.y_min.min(other.y_min);
        self.y_max = self.y_max.max(other.y_max);
    }

    pub fn is_empty(&self) -> bool {
        self.x_min > self.x_max || self.y_min > self.y_max
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::new()
    }
}

/// Signed curvature (1/m) of the circle through three points; positive when turning left
pub fn menger_curvature(a: &Point2D, b: &Point2D, c: &Point2D) -> f64 {
    let cross = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    let denom = a.distance(b) * b.distance(c) * c.distance(a);
    if denom <= f64::EPSILON {
        return 0.0;
    }
    2.0 * cross / denom
}

/// Normalise an angle difference into (-PI, PI]
pub fn wrap_angle(angle: f64) -> f64 {
    let mut wrapped = angle % std::f64::consts::TAU;
    if wrapped > std::f64::consts::PI {
        wrapped -= std::f64::consts::TAU;
    } else if wrapped <= -std::f64::consts::PI {
        wrapped += std::f64::consts::TAU;
    }
    wrapped
}
