//! Low-level computational geometry shared by the whole engine.
//!
//! Coordinates are metric, in an arbitrary projected (planar) CRS. Most
//! predicates work in the horizontal plane; the z ordinate rides along and is
//! interpolated where needed. The mean-plane regression implements equations
//! VI-3 and VI-4 of the JRC-2012 reference report.

use serde::{Deserialize, Serialize};

/// Intersection/containment tolerance for triangle navigation, in meters.
pub const EPSILON: f64 = 1e-7;

/// A 3D point. `z` may be `NaN` when the vertical ordinate is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Point in the horizontal plane with unknown elevation.
    pub fn flat(x: f64, y: f64) -> Self {
        Self { x, y, z: f64::NAN }
    }

    /// Horizontal (2D) distance.
    pub fn distance_2d(&self, other: &Coord) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// True 3D distance.
    pub fn distance_3d(&self, other: &Coord) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Replace the vertical ordinate.
    pub fn with_z(&self, z: f64) -> Coord {
        Coord::new(self.x, self.y, z)
    }
}

/// A point of the unfolded (distance, elevation) propagation plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Axis-aligned rectangle in the horizontal plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Empty envelope, ready to be extended point by point.
    pub fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    pub fn width(&self) -> f64 {
        (self.max_x - self.min_x).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.max_y - self.min_y).max(0.0)
    }

    pub fn expand_to_include(&mut self, p: &Coord) {
        self.min_x = self.min_x.min(p.x);
        self.min_y = self.min_y.min(p.y);
        self.max_x = self.max_x.max(p.x);
        self.max_y = self.max_y.max(p.y);
    }

    /// Envelope grown by `margin` on each side.
    pub fn expanded_by(&self, margin: f64) -> Envelope {
        Envelope::new(
            self.min_x - margin,
            self.min_y - margin,
            self.max_x + margin,
            self.max_y + margin,
        )
    }

    pub fn contains(&self, p: &Coord) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }
}

/// Signed area of the triangle (a, b, c), positive when counter-clockwise.
pub fn cross_2d(a: &Coord, b: &Coord, c: &Coord) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// Counter-clockwise orientation test in the horizontal plane.
pub fn is_ccw(a: &Coord, b: &Coord, c: &Coord) -> bool {
    cross_2d(a, b, c) > 0.0
}

/// Intersection of the 2D segments `[p0, p1]` and `[q0, q1]`.
///
/// Returns the crossing point (z = NaN) when the segments properly intersect
/// or touch; `None` for parallel or disjoint segments.
pub fn segment_intersection_2d(p0: &Coord, p1: &Coord, q0: &Coord, q1: &Coord) -> Option<Coord> {
    let rx = p1.x - p0.x;
    let ry = p1.y - p0.y;
    let sx = q1.x - q0.x;
    let sy = q1.y - q0.y;
    let denom = rx * sy - ry * sx;
    if denom.abs() < EPSILON * EPSILON {
        return None;
    }
    let qpx = q0.x - p0.x;
    let qpy = q0.y - p0.y;
    let t = (qpx * sy - qpy * sx) / denom;
    let u = (qpx * ry - qpy * rx) / denom;
    if !(-EPSILON..=1.0 + EPSILON).contains(&t) || !(-EPSILON..=1.0 + EPSILON).contains(&u) {
        return None;
    }
    Some(Coord::flat(p0.x + t * rx, p0.y + t * ry))
}

/// Fraction of the projection of `p` on the infinite line through `[a, b]`,
/// 0 at `a` and 1 at `b`.
pub fn projection_factor(p: &Coord, a: &Coord, b: &Coord) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len2 = dx * dx + dy * dy;
    if len2 < EPSILON * EPSILON {
        return 0.0;
    }
    ((p.x - a.x) * dx + (p.y - a.y) * dy) / len2
}

/// Closest point to `p` on the finite segment `[a, b]` (z interpolated).
pub fn closest_point_on_segment(p: &Coord, a: &Coord, b: &Coord) -> Coord {
    let f = projection_factor(p, a, b).clamp(0.0, 1.0);
    Coord::new(
        a.x + f * (b.x - a.x),
        a.y + f * (b.y - a.y),
        a.z + f * (b.z - a.z),
    )
}

/// Mirror image of `p` across the infinite line through the wall `[a, b]`,
/// keeping the vertical ordinate.
pub fn mirror_point(p: &Coord, a: &Coord, b: &Coord) -> Coord {
    let f = projection_factor(p, a, b);
    let proj_x = a.x + f * (b.x - a.x);
    let proj_y = a.y + f * (b.y - a.y);
    Coord::new(2.0 * proj_x - p.x, 2.0 * proj_y - p.y, p.z)
}

/// Linear z interpolation at `pt` between the segment endpoints `a` and `b`,
/// by horizontal distance fraction.
pub fn interpolate_z_on_segment(pt: &Coord, a: &Coord, b: &Coord) -> f64 {
    let seg_len = a.distance_2d(b);
    if seg_len < EPSILON {
        return a.z;
    }
    a.z + (b.z - a.z) * (a.distance_2d(pt) / seg_len)
}

/// z of the plane through the triangle (a, b, c) at the horizontal position
/// of `p`.
pub fn interpolate_z_in_triangle(p: &Coord, a: &Coord, b: &Coord, c: &Coord) -> f64 {
    let ux = b.x - a.x;
    let uy = b.y - a.y;
    let uz = b.z - a.z;
    let vx = c.x - a.x;
    let vy = c.y - a.y;
    let vz = c.z - a.z;
    // Plane normal
    let nx = uy * vz - uz * vy;
    let ny = uz * vx - ux * vz;
    let nz = ux * vy - uy * vx;
    if nz.abs() < EPSILON {
        // Degenerate (vertical) triangle
        return (a.z + b.z + c.z) / 3.0;
    }
    a.z - (nx * (p.x - a.x) + ny * (p.y - a.y)) / nz
}

/// Barycentric point-in-triangle test in the horizontal plane.
pub fn point_in_triangle(p: &Coord, a: &Coord, b: &Coord, c: &Coord) -> bool {
    let v0x = c.x - a.x;
    let v0y = c.y - a.y;
    let v1x = b.x - a.x;
    let v1y = b.y - a.y;
    let v2x = p.x - a.x;
    let v2y = p.y - a.y;

    let dot00 = v0x * v0x + v0y * v0y;
    let dot01 = v0x * v1x + v0y * v1y;
    let dot02 = v0x * v2x + v0y * v2y;
    let dot11 = v1x * v1x + v1y * v1y;
    let dot12 = v1x * v2x + v1y * v2y;

    let denom = dot00 * dot11 - dot01 * dot01;
    if denom.abs() < EPSILON * EPSILON {
        return false;
    }
    let inv = 1.0 / denom;
    let u = (dot11 * dot02 - dot01 * dot12) * inv;
    let v = (dot00 * dot12 - dot01 * dot02) * inv;

    u > -EPSILON && v > -EPSILON && u + v < 1.0 + EPSILON
}

/// Unfold a 3D polyline into the (distance, elevation) plane.
///
/// The abscissa is the cumulative true 3D distance along the polyline so that
/// segment lengths survive the projection even on sloped terrain; the
/// ordinate is the original z.
pub fn unfold(points: &[Coord]) -> Vec<Point2> {
    let mut out = Vec::with_capacity(points.len());
    if points.is_empty() {
        return out;
    }
    out.push(Point2::new(0.0, points[0].z));
    for i in 1..points.len() {
        let d = points[i].distance_3d(&points[i - 1]);
        out.push(Point2::new(out[i - 1].x + d, points[i].z));
    }
    out
}

/// Least-squares mean plane `y = a*x + b` of a piecewise-linear terrain
/// profile in the unfolded plane (JRC-2012 report, equations VI-3 and VI-4).
///
/// Degenerate inputs fall back to a flat plane: a single point yields
/// `(0, z)`, two points yield their secant line, a zero-width profile yields
/// the mean elevation.
pub fn mean_plane(profile: &[Point2]) -> (f64, f64) {
    let n = profile.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    if n == 1 {
        return (0.0, profile[0].y);
    }
    let x0 = profile[0].x;
    let xn = profile[n - 1].x;
    let span = xn - x0;
    if span.abs() < EPSILON {
        let mean = profile.iter().map(|p| p.y).sum::<f64>() / n as f64;
        return (0.0, mean);
    }
    if n == 2 {
        let a = (profile[1].y - profile[0].y) / span;
        return (a, profile[0].y - a * x0);
    }

    // Equation VI-3: piecewise integration of the profile.
    let mut val_a1 = 0.0;
    let mut val_a2 = 0.0;
    let mut val_b1 = 0.0;
    let mut val_b2 = 0.0;
    for w in profile.windows(2) {
        let (p1, p2) = (w[0], w[1]);
        let dx = p2.x - p1.x;
        if dx != 0.0 {
            let ai = (p2.y - p1.y) / dx;
            let bi = p1.y - ai * p1.x;
            let d2 = p2.x.powi(2) - p1.x.powi(2);
            let d3 = p2.x.powi(3) - p1.x.powi(3);
            val_a1 += ai * d3;
            val_a2 += bi * d2;
            val_b1 += ai * d2;
            val_b2 += bi * dx;
        }
    }
    let val_a = 2.0 / 3.0 * val_a1 + val_a2;
    let val_b = val_b1 + 2.0 * val_b2;
    let dist3 = span.powi(3);
    let dist4 = span.powi(4);

    // Equation VI-4.
    let a = 3.0 * (2.0 * val_a - val_b * (xn + x0)) / dist3;
    let b = 2.0 * val_b * (xn.powi(3) - x0.powi(3)) / dist4 - 3.0 * val_a * (xn + x0) / dist3;
    (a, b)
}

/// Orthogonal projection of `p` on the line `y = a*x + b` of the unfolded
/// plane.
pub fn project_on_mean_plane(p: &Point2, a: f64, b: f64) -> Point2 {
    let denom = 1.0 + a * a;
    let x = (p.x + a * (p.y - b)) / denom;
    Point2::new(x, a * x + b)
}

/// Curved-earth corrected length of a sub-path `mn` of a path of direct
/// distance `d` under favorable propagation conditions.
pub fn to_curve(mn: f64, d: f64) -> f64 {
    let gamma = 2.0 * 1000f64.max(8.0 * d);
    gamma * (mn / gamma).asin()
}

/// 2D convex hull (closed CW ring, first point repeated last) of a point set,
/// by Andrew's monotone chain. z ordinates ride along with their points.
pub fn convex_hull(points: &[Coord]) -> Vec<Coord> {
    let mut pts: Vec<Coord> = points.to_vec();
    pts.sort_by(|p, q| {
        p.x.partial_cmp(&q.x)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(p.y.partial_cmp(&q.y).unwrap_or(std::cmp::Ordering::Equal))
    });
    pts.dedup_by(|p, q| (p.x - q.x).abs() < EPSILON && (p.y - q.y).abs() < EPSILON);
    let n = pts.len();
    if n < 3 {
        let mut ring = pts.clone();
        if let Some(first) = ring.first().copied() {
            ring.push(first);
        }
        return ring;
    }

    let mut lower: Vec<Coord> = Vec::with_capacity(n);
    for p in &pts {
        while lower.len() >= 2
            && cross_2d(&lower[lower.len() - 2], &lower[lower.len() - 1], p) <= 0.0
        {
            lower.pop();
        }
        lower.push(*p);
    }
    let mut upper: Vec<Coord> = Vec::with_capacity(n);
    for p in pts.iter().rev() {
        while upper.len() >= 2
            && cross_2d(&upper[upper.len() - 2], &upper[upper.len() - 1], p) <= 0.0
        {
            upper.pop();
        }
        upper.push(*p);
    }
    // CCW ring from the two chains, then reverse to CW.
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower.reverse();
    let first = lower[0];
    lower.push(first);
    lower
}

/// Perimeter of a closed ring.
pub fn ring_length(ring: &[Coord]) -> f64 {
    ring.windows(2).map(|w| w[0].distance_2d(&w[1])).sum()
}
