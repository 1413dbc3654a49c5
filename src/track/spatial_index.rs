// Balanced 2D k-d tree over a racing line's points

use super::geometry::Point2D;
use super::racing_line::RacingLine;

/// Result of a nearest-point or radius query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index into the racing line's points
    pub index: usize,
    pub point: Point2D,
    /// Arc length of the point along the line
    pub arc_length: f64,
    pub distance: f64,
}

/// Immutable k-d tree over a snapshot of one racing line.
///
/// The tree is stored implicitly: `order` is a permutation of point indices in
/// which every subrange's median element is the splitting node of that range,
/// alternating x and y with depth. A changed line needs a new index; there is no
/// way to edit one in place.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    points: Vec<Point2D>,
    arc_lengths: Vec<f64>,
    order: Vec<usize>,
}

#[derive(Clone, Copy)]
struct Best {
    index: usize,
    distance_squared: f64,
}

impl SpatialIndex {
    pub fn build(line: &RacingLine) -> Self {
        Self::from_points(line.points.clone(), line.arc_lengths.clone())
    }

    /// Build from points in travel order and their arc lengths
    pub fn from_points(points: Vec<Point2D>, arc_lengths: Vec<f64>) -> Self {
        debug_assert_eq!(points.len(), arc_lengths.len());
        let mut order: Vec<usize> = (0..points.len()).collect();
        Self::partition(&points, &mut order, 0);
        Self {
            points,
            arc_lengths,
            order,
        }
    }

    fn partition(points: &[Point2D], order: &mut [usize], depth: usize) {
        if order.len() <= 1 {
            return;
        }
        let mid = order.len() / 2;
        let axis = depth % 2;
        order.select_nth_unstable_by(mid, |a, b| {
            coordinate(&points[*a], axis)
                .total_cmp(&coordinate(&points[*b], axis))
                .then(a.cmp(b))
        });
        let (left, right) = order.split_at_mut(mid);
        Self::partition(points, left, depth + 1);
        Self::partition(points, &mut right[1..], depth + 1);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn neighbor(&self, index: usize, distance_squared: f64) -> Neighbor {
        Neighbor {
            index,
            point: self.points[index],
            arc_length: self.arc_lengths[index],
            distance: distance_squared.sqrt(),
        }
    }

    /// Closest point to `query`; equal distances resolve to the lowest arc length
    pub fn nearest(&self, query: &Point2D) -> Option<Neighbor> {
        if self.points.is_empty() {
            return None;
        }
        let mut best = Best {
            index: usize::MAX,
            distance_squared: f64::INFINITY,
        };
        self.nearest_in(0, self.order.len(), 0, query, &mut best);
        Some(self.neighbor(best.index, best.distance_squared))
    }

    fn nearest_in(&self, lo: usize, hi: usize, depth: usize, query: &Point2D, best: &mut Best) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        let index = self.order[mid];
        let point = &self.points[index];
        let distance_squared = point.distance_squared(query);
        if distance_squared < best.distance_squared
            || (distance_squared == best.distance_squared && self.precedes(index, best.index))
        {
            *best = Best {
                index,
                distance_squared,
            };
        }

        let axis = depth % 2;
        let diff = coordinate(query, axis) - coordinate(point, axis);
        let (near, far) = if diff < 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };
        self.nearest_in(near.0, near.1, depth + 1, query, best);
        // Points on the far side are at least |diff| away; equal distance may still win a tie
        if diff * diff <= best.distance_squared {
            self.nearest_in(far.0, far.1, depth + 1, query, best);
        }
    }

    fn precedes(&self, a: usize, b: usize) -> bool {
        if b == usize::MAX {
            return true;
        }
        match self.arc_lengths[a].total_cmp(&self.arc_lengths[b]) {
            std::cmp::Ordering::Equal => a < b,
            ordering => ordering.is_lt(),
        }
    }

    /// All points within `radius` of `query`, ordered by arc length
    pub fn within_radius(&self, query: &Point2D, radius: f64) -> Vec<Neighbor> {
        let mut found = Vec::new();
        if radius < 0.0 || !radius.is_finite() {
            return found;
        }
        self.within_radius_in(0, self.order.len(), 0, query, radius * radius, &mut found);
        found.sort_by(|a, b| {
            a.arc_length
                .total_cmp(&b.arc_length)
                .then(a.index.cmp(&b.index))
        });
        found
    }

    fn within_radius_in(
        &self,
        lo: usize,
        hi: usize,
        depth: usize,
        query: &Point2D,
        radius_squared: f64,
        found: &mut Vec<Neighbor>,
    ) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        let index = self.order[mid];
        let point = &self.points[index];
        let distance_squared = point.distance_squared(query);
        if distance_squared <= radius_squared {
            found.push(self.neighbor(index, distance_squared));
        }
        let axis = depth % 2;
        let diff = coordinate(query, axis) - coordinate(point, axis);
        if diff < 0.0 || diff * diff <= radius_squared {
            self.within_radius_in(lo, mid, depth + 1, query, radius_squared, found);
        }
        if diff >= 0.0 || diff * diff <= radius_squared {
            self.within_radius_in(mid + 1, hi, depth + 1, query, radius_squared, found);
        }
    }
}

fn coordinate(point: &Point2D, axis: usize) -> f64 {
    if axis == 0 { point.x } else { point.y }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn brute_force_nearest(points: &[Point2D], arc_lengths: &[f64], query: &Point2D) -> usize {
        let mut best = 0;
        for i in 1..points.len() {
            let d = points[i].distance_squared(query);
            let best_d = points[best].distance_squared(query);
            if d < best_d || (d == best_d && arc_lengths[i] < arc_lengths[best]) {
                best = i;
            }
        }
        best
    }

    fn loop_points(n: usize, wobble: f64) -> (Vec<Point2D>, Vec<f64>) {
        let mut points = Vec::with_capacity(n);
        for i in 0..n {
            let angle = std::f64::consts::TAU * i as f64 / n as f64;
            let r = 400.0 + wobble * (5.0 * angle).sin();
            points.push(Point2D::new(r * angle.cos(), 0.6 * r * angle.sin()));
        }
        let mut arc_lengths = vec![0.0];
        for i in 1..n {
            let s = arc_lengths[i - 1] + points[i - 1].distance(&points[i]);
            arc_lengths.push(s);
        }
        (points, arc_lengths)
    }

    #[test]
    fn test_empty_index() {
        let index = SpatialIndex::from_points(Vec::new(), Vec::new());
        assert!(index.nearest(&Point2D::new(0.0, 0.0)).is_none());
        assert!(index.within_radius(&Point2D::new(0.0, 0.0), 10.0).is_empty());
    }

    #[test]
    fn test_nearest_exact_point() {
        let (points, arcs) = loop_points(1000, 30.0);
        let index = SpatialIndex::from_points(points.clone(), arcs.clone());
        for i in (0..1000).step_by(37) {
            let hit = index.nearest(&points[i]).unwrap();
            assert_eq!(hit.index, i);
            assert_eq!(hit.distance, 0.0);
            assert_eq!(hit.arc_length, arcs[i]);
        }
    }

    #[test]
    fn test_ties_resolve_to_lowest_arc_length() {
        // Four points on a circle around the query, all equidistant
        let points = vec![
            Point2D::new(1.0, 0.0),
            Point2D::new(0.0, 1.0),
            Point2D::new(-1.0, 0.0),
            Point2D::new(0.0, -1.0),
        ];
        let arcs = vec![0.0, 1.0, 2.0, 3.0];
        let index = SpatialIndex::from_points(points, arcs);
        assert_eq!(index.nearest(&Point2D::new(0.0, 0.0)).unwrap().index, 0);

        // Duplicate coordinates, later arc length must lose
        let points = vec![
            Point2D::new(5.0, 5.0),
            Point2D::new(0.0, 0.0),
            Point2D::new(5.0, 5.0),
        ];
        let index = SpatialIndex::from_points(points, vec![0.0, 7.0, 14.0]);
        assert_eq!(index.nearest(&Point2D::new(6.0, 6.0)).unwrap().index, 0);
    }

    #[test]
    fn test_within_radius_matches_scan() {
        let (points, arcs) = loop_points(2000, 20.0);
        let index = SpatialIndex::from_points(points.clone(), arcs);
        let query = Point2D::new(395.0, 10.0);
        let found = index.within_radius(&query, 25.0);
        let expected: Vec<usize> = (0..points.len())
            .filter(|i| points[*i].distance(&query) <= 25.0)
            .collect();
        let mut found_indices: Vec<usize> = found.iter().map(|n| n.index).collect();
        found_indices.sort_unstable();
        assert!(!expected.is_empty());
        assert_eq!(found_indices, expected);
        for pair in found.windows(2) {
            assert!(pair[0].arc_length <= pair[1].arc_length);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_nearest_matches_brute_force(
            wobble in 0.0f64..80.0,
            n in 50usize..3000,
            queries in prop::collection::vec((-600.0f64..600.0, -600.0f64..600.0), 1000),
        ) {
            let (points, arcs) = loop_points(n, wobble);
            let index = SpatialIndex::from_points(points.clone(), arcs.clone());
            for (x, y) in queries {
                let query = Point2D::new(x, y);
                let hit = index.nearest(&query).unwrap();
                let expected = brute_force_nearest(&points, &arcs, &query);
                prop_assert_eq!(hit.index, expected);
                prop_assert!(hit.index < points.len());
            }
        }

        #[test]
        fn prop_nearest_on_grid_with_ties(
            queries in prop::collection::vec((-3i32..23, -3i32..23), 1000),
        ) {
            // Integer grid in serpentine order produces many exact ties
            let mut points = Vec::new();
            for row in 0..20 {
                for col in 0..20 {
                    let col = if row % 2 == 0 { col } else { 19 - col };
                    points.push(Point2D::new(col as f64, row as f64));
                }
            }
            let arcs: Vec<f64> = (0..points.len()).map(|i| i as f64).collect();
            let index = SpatialIndex::from_points(points.clone(), arcs.clone());
            for (x, y) in queries {
                let query = Point2D::new(x as f64 + 0.5, y as f64 + 0.5);
                let hit = index.nearest(&query).unwrap();
                prop_assert_eq!(hit.index, brute_force_nearest(&points, &arcs, &query));
            }
        }
    }
}
