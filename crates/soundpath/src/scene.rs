//! Input data model and scene builder.
//!
//! A scene collects the geometry intersecting one computation cell: building
//! footprints with heights, free-standing walls, topographic points and
//! breaklines, and ground-absorption zones. The builder validates rings and
//! merges overlapping building footprints before the mesh is triangulated.

use geo::{BooleanOps, Contains};
use geo_types::{Coord as GeoCoord, LineString, Point, Polygon};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SoundPathError};
use crate::geom::{segment_intersection_2d, Coord, Envelope, EPSILON};

/// Kind of scene feature a wall segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObstacleKind {
    Building,
    Wall,
    Topography,
}

/// A building: closed footprint ring, height above ground, and an optional
/// per-frequency-band facade absorption spectrum.
#[derive(Debug, Clone)]
pub struct Building {
    /// Exterior ring, closed (first vertex repeated last).
    pub ring: Vec<Coord>,
    /// Height of the roof above the local ground, in meters.
    pub height: f64,
    /// Facade absorption, one coefficient per frequency band. Empty means
    /// acoustically hard.
    pub alpha: Vec<f64>,
}

/// A free-standing reflecting/obstructing wall segment.
#[derive(Debug, Clone)]
pub struct Wall {
    pub p0: Coord,
    pub p1: Coord,
    /// Height of the wall top above the local ground, in meters.
    pub height: f64,
    /// Absorption spectrum, one coefficient per frequency band.
    pub alpha: Vec<f64>,
}

/// A ground-absorption zone: polygon with a G coefficient in `[0, 1]`
/// (0 = acoustically hard/reflective, 1 = fully absorptive).
#[derive(Debug, Clone)]
pub struct GroundZone {
    /// Exterior ring, closed.
    pub ring: Vec<Coord>,
    pub g: f64,
}

/// Scene geometry accumulator for one computation cell.
///
/// ```
/// use soundpath::geom::{Coord, Envelope};
/// use soundpath::scene::SceneBuilder;
///
/// let mut builder = SceneBuilder::new(Envelope::new(-10.0, -10.0, 110.0, 110.0));
/// builder.add_wall(Coord::new(50.0, 0.0, 0.0), Coord::new(50.0, 20.0, 0.0), 4.0, vec![]);
/// let index = builder.build().unwrap();
/// assert!(index.height_at(&Coord::flat(50.0, 50.0)).is_some());
/// ```
#[derive(Debug, Clone)]
pub struct SceneBuilder {
    pub(crate) envelope: Envelope,
    pub(crate) buildings: Vec<Building>,
    pub(crate) walls: Vec<Wall>,
    pub(crate) topo_points: Vec<Coord>,
    pub(crate) topo_lines: Vec<(Coord, Coord)>,
    pub(crate) ground_zones: Vec<GroundZone>,
    pub(crate) densify_interval: f64,
    pub(crate) default_g: f64,
}

impl SceneBuilder {
    /// Default spacing of the Steiner points inserted along constraint
    /// edges before triangulation, in meters.
    pub const DEFAULT_DENSIFY_INTERVAL: f64 = 5.0;

    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            buildings: Vec::new(),
            walls: Vec::new(),
            topo_points: Vec::new(),
            topo_lines: Vec::new(),
            ground_zones: Vec::new(),
            densify_interval: Self::DEFAULT_DENSIFY_INTERVAL,
            default_g: 0.0,
        }
    }

    /// Ground absorption used outside every declared zone. Defaults to 0
    /// (acoustically hard).
    pub fn default_g(&mut self, g: f64) -> &mut Self {
        self.default_g = g.clamp(0.0, 1.0);
        self
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Override the constraint-edge densification spacing.
    pub fn densify_interval(&mut self, interval: f64) -> &mut Self {
        self.densify_interval = interval.max(0.1);
        self
    }

    /// Add a building footprint. The ring is closed automatically if needed.
    pub fn add_building(&mut self, ring: Vec<Coord>, height: f64, alpha: Vec<f64>) -> &mut Self {
        self.buildings.push(Building {
            ring: close_ring(ring),
            height,
            alpha,
        });
        self
    }

    /// Add a free-standing wall.
    pub fn add_wall(&mut self, p0: Coord, p1: Coord, height: f64, alpha: Vec<f64>) -> &mut Self {
        self.walls.push(Wall {
            p0,
            p1,
            height,
            alpha,
        });
        self
    }

    /// Add an isolated topographic point (x, y, ground elevation).
    pub fn add_topo_point(&mut self, p: Coord) -> &mut Self {
        self.topo_points.push(p);
        self
    }

    /// Add a topographic breakline between two elevated points.
    pub fn add_topo_line(&mut self, p0: Coord, p1: Coord) -> &mut Self {
        self.topo_lines.push((p0, p1));
        self
    }

    /// Add a ground-absorption zone. `g` is clamped to `[0, 1]`.
    pub fn add_ground_zone(&mut self, ring: Vec<Coord>, g: f64) -> &mut Self {
        self.ground_zones.push(GroundZone {
            ring: close_ring(ring),
            g: g.clamp(0.0, 1.0),
        });
        self
    }

    /// Convenience: rectangular ground-absorption zone.
    pub fn add_ground_zone_rect(
        &mut self,
        min_x: f64,
        max_x: f64,
        min_y: f64,
        max_y: f64,
        g: f64,
    ) -> &mut Self {
        self.add_ground_zone(
            vec![
                Coord::new(min_x, min_y, 0.0),
                Coord::new(max_x, min_y, 0.0),
                Coord::new(max_x, max_y, 0.0),
                Coord::new(min_x, max_y, 0.0),
            ],
            g,
        )
    }

    /// Validate the collected geometry. Fails fast on the first malformed
    /// ring so a bad cell aborts before triangulation.
    pub fn validate(&self) -> Result<()> {
        for (id, b) in self.buildings.iter().enumerate() {
            validate_ring(&b.ring, "building", id)?;
            if !b.height.is_finite() || b.height < 0.0 {
                return Err(SoundPathError::MalformedGeometry {
                    kind: "building",
                    id,
                    reason: format!("invalid height {}", b.height),
                });
            }
        }
        for (id, z) in self.ground_zones.iter().enumerate() {
            validate_ring(&z.ring, "ground zone", id)?;
        }
        for (id, w) in self.walls.iter().enumerate() {
            if w.p0.distance_2d(&w.p1) < EPSILON {
                return Err(SoundPathError::MalformedGeometry {
                    kind: "wall",
                    id,
                    reason: "zero-length wall".into(),
                });
            }
        }
        Ok(())
    }

    /// Merged building footprints: overlapping footprints are unioned so no
    /// sliver gaps survive between adjacent buildings. A merged building
    /// keeps the maximum height and the absorption of its first part.
    pub(crate) fn merged_buildings(&self) -> Vec<Building> {
        let mut merged: Vec<(Polygon<f64>, Building)> = Vec::new();
        for b in &self.buildings {
            let poly = ring_to_polygon(&b.ring);
            let mut current_poly = poly;
            let mut current = b.clone();
            // Absorb every already-merged footprint that intersects this one.
            let mut i = 0;
            while i < merged.len() {
                if polygons_overlap(&current_poly, &merged[i].0) {
                    let (other_poly, other) = merged.swap_remove(i);
                    let union = current_poly.union(&other_poly);
                    // Union of two overlapping simply-connected footprints
                    // is a single polygon.
                    if let Some(p) = union.0.into_iter().next() {
                        current_poly = p;
                    }
                    current.height = current.height.max(other.height);
                    if current.alpha.is_empty() {
                        current.alpha = other.alpha;
                    }
                    i = 0;
                } else {
                    i += 1;
                }
            }
            current.ring = polygon_to_ring(&current_poly);
            merged.push((current_poly, current));
        }
        merged.into_iter().map(|(_, b)| b).collect()
    }

    /// Triangulate the scene and build the immutable [`SceneIndex`].
    ///
    /// [`SceneIndex`]: crate::index::SceneIndex
    pub fn build(&self) -> Result<crate::index::SceneIndex> {
        crate::index::SceneIndex::build(self)
    }

    /// Copy of the builder restricted to `env`, keeping every feature whose
    /// bounding box intersects it. The grid scheduler builds one subset per
    /// computation cell.
    pub fn subset(&self, env: &Envelope) -> SceneBuilder {
        let mut out = SceneBuilder::new(*env);
        out.densify_interval = self.densify_interval;
        out.default_g = self.default_g;
        for b in &self.buildings {
            if ring_envelope(&b.ring).intersects(env) {
                out.buildings.push(b.clone());
            }
        }
        for w in &self.walls {
            if ring_envelope(&[w.p0, w.p1]).intersects(env) {
                out.walls.push(w.clone());
            }
        }
        for p in &self.topo_points {
            if env.contains(p) {
                out.topo_points.push(*p);
            }
        }
        for (p0, p1) in &self.topo_lines {
            if ring_envelope(&[*p0, *p1]).intersects(env) {
                out.topo_lines.push((*p0, *p1));
            }
        }
        for z in &self.ground_zones {
            if ring_envelope(&z.ring).intersects(env) {
                out.ground_zones.push(z.clone());
            }
        }
        out
    }
}

fn ring_envelope(points: &[Coord]) -> Envelope {
    let mut env = Envelope::empty();
    for p in points {
        env.expand_to_include(p);
    }
    env
}

/// Close a ring by repeating its first vertex if needed.
fn close_ring(mut ring: Vec<Coord>) -> Vec<Coord> {
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last()) {
        if first.distance_2d(last) > EPSILON {
            ring.push(first);
        }
    }
    ring
}

fn validate_ring(ring: &[Coord], kind: &'static str, id: usize) -> Result<()> {
    if ring.len() < 4 {
        return Err(SoundPathError::MalformedGeometry {
            kind,
            id,
            reason: format!("ring has {} vertices, at least 3 required", ring.len().saturating_sub(1)),
        });
    }
    let area: f64 = ring
        .windows(2)
        .map(|w| (w[0].x * w[1].y - w[1].x * w[0].y) / 2.0)
        .sum();
    if area.abs() < EPSILON {
        return Err(SoundPathError::MalformedGeometry {
            kind,
            id,
            reason: "degenerate ring (zero area)".into(),
        });
    }
    // Proper self-intersection test between non-adjacent edges.
    let n = ring.len() - 1;
    for i in 0..n {
        for j in i + 2..n {
            if i == 0 && j == n - 1 {
                continue; // closing edge is adjacent to the first
            }
            let (a0, a1) = (&ring[i], &ring[i + 1]);
            let (b0, b1) = (&ring[j], &ring[j + 1]);
            if let Some(p) = segment_intersection_2d(a0, a1, b0, b1) {
                // Touching at shared vertices is fine; crossing is not.
                let touches_end = [a0, a1, b0, b1]
                    .iter()
                    .any(|c| c.distance_2d(&p) < EPSILON * 10.0);
                if !touches_end {
                    return Err(SoundPathError::MalformedGeometry {
                        kind,
                        id,
                        reason: format!("self-intersecting ring near ({:.3}, {:.3})", p.x, p.y),
                    });
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn ring_to_polygon(ring: &[Coord]) -> Polygon<f64> {
    Polygon::new(
        LineString::from(
            ring.iter()
                .map(|c| GeoCoord { x: c.x, y: c.y })
                .collect::<Vec<_>>(),
        ),
        vec![],
    )
}

pub(crate) fn polygon_to_ring(poly: &Polygon<f64>) -> Vec<Coord> {
    poly.exterior()
        .coords()
        .map(|c| Coord::new(c.x, c.y, 0.0))
        .collect()
}

pub(crate) fn polygon_contains(poly: &Polygon<f64>, p: &Coord) -> bool {
    poly.contains(&Point::new(p.x, p.y))
}

fn polygons_overlap(a: &Polygon<f64>, b: &Polygon<f64>) -> bool {
    use geo::Intersects;
    a.intersects(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, side: f64) -> Vec<Coord> {
        vec![
            Coord::new(x0, y0, 0.0),
            Coord::new(x0 + side, y0, 0.0),
            Coord::new(x0 + side, y0 + side, 0.0),
            Coord::new(x0, y0 + side, 0.0),
        ]
    }

    #[test]
    fn self_intersecting_ring_is_rejected() {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 10.0, 10.0));
        builder.add_building(
            vec![
                Coord::new(0.0, 0.0, 0.0),
                Coord::new(10.0, 10.0, 0.0),
                Coord::new(10.0, 0.0, 0.0),
                Coord::new(0.0, 10.0, 0.0),
            ],
            5.0,
            vec![],
        );
        assert!(matches!(
            builder.validate(),
            Err(SoundPathError::MalformedGeometry { kind: "building", .. })
        ));
    }

    #[test]
    fn valid_square_passes_validation() {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 20.0, 20.0));
        builder.add_building(square(2.0, 2.0, 5.0), 8.0, vec![]);
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn overlapping_footprints_are_merged() {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 40.0, 40.0));
        builder.add_building(square(0.0, 0.0, 10.0), 5.0, vec![]);
        builder.add_building(square(5.0, 0.0, 10.0), 9.0, vec![]);
        builder.add_building(square(25.0, 25.0, 5.0), 4.0, vec![]);
        let merged = builder.merged_buildings();
        assert_eq!(merged.len(), 2);
        let tall = merged
            .iter()
            .find(|b| b.ring.iter().any(|c| c.x > 10.0 && c.y < 15.0))
            .unwrap();
        assert!((tall.height - 9.0).abs() < 1e-12);
    }

    #[test]
    fn zero_length_wall_is_rejected() {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 10.0, 10.0));
        builder.add_wall(Coord::new(1.0, 1.0, 0.0), Coord::new(1.0, 1.0, 0.0), 2.0, vec![]);
        assert!(builder.validate().is_err());
    }
}
