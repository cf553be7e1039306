//! Immutable spatial index over one computation cell.
//!
//! Built once from a [`SceneBuilder`], then shared read-only across worker
//! threads. Combines the terrain mesh with an R-tree of vertical facets
//! (building facades and free-standing walls) and the ground-absorption
//! zones. All visibility queries of the engine go through this type.

use rstar::{RTree, RTreeObject, AABB};

use crate::error::Result;
use crate::geom::{
    closest_point_on_segment, cross_2d, interpolate_z_on_segment, projection_factor,
    segment_intersection_2d, Coord, Envelope, EPSILON,
};
use crate::mesh::Mesh;
use crate::scene::{polygon_contains, ring_to_polygon, Building, GroundZone, ObstacleKind, SceneBuilder};

/// Offset applied to wide-angle diffraction corners, in meters, so hull
/// walks do not re-intersect the footprint they originate from.
const WIDE_ANGLE_OFFSET: f64 = 0.01;

/// Crossings closer than this to a query endpoint are ignored by the
/// free-field test, so rays may start or end on a facet.
const ENDPOINT_SKIP: f64 = 1e-6;

/// A vertical rectangle of the scene: one facade edge of a building, or a
/// free-standing wall. Endpoints carry the local ground elevation; the top
/// elevation is absolute.
#[derive(Debug, Clone)]
pub struct Facet {
    pub p0: Coord,
    pub p1: Coord,
    pub top_z0: f64,
    pub top_z1: f64,
    pub kind: ObstacleKind,
    /// Index of the owning building or wall in the scene.
    pub origin: usize,
    pub alpha: Vec<f64>,
}

impl Facet {
    /// Absolute top elevation at the horizontal position of `p`.
    pub fn top_z_at(&self, p: &Coord) -> f64 {
        let f = projection_factor(p, &self.p0, &self.p1).clamp(0.0, 1.0);
        self.top_z0 + f * (self.top_z1 - self.top_z0)
    }

    pub fn length(&self) -> f64 {
        self.p0.distance_2d(&self.p1)
    }
}

#[derive(Debug, Clone)]
struct FacetEntry {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for FacetEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

/// Read-only scene index for path queries.
pub struct SceneIndex {
    mesh: Mesh,
    buildings: Vec<Building>,
    ground_zones: Vec<GroundZone>,
    facets: Vec<Facet>,
    facet_tree: RTree<FacetEntry>,
    /// Absolute roof elevation per merged building.
    roof_z: Vec<f64>,
    envelope: Envelope,
    default_g: f64,
}

impl SceneIndex {
    /// Validate, triangulate and index the scene.
    pub fn build(builder: &SceneBuilder) -> Result<SceneIndex> {
        builder.validate()?;
        let buildings = builder.merged_buildings();
        let mesh = Mesh::build(builder, &buildings)?;

        let roof_z: Vec<f64> = buildings
            .iter()
            .map(|b| {
                let ground = b
                    .ring
                    .iter()
                    .filter_map(|p| mesh.height_at(p))
                    .fold(f64::NEG_INFINITY, f64::max);
                let ground = if ground.is_finite() { ground } else { 0.0 };
                ground + b.height
            })
            .collect();

        let mut facets: Vec<Facet> = Vec::new();
        for (id, b) in buildings.iter().enumerate() {
            let top = roof_z[id];
            for w in b.ring.windows(2) {
                if w[0].distance_2d(&w[1]) < EPSILON {
                    continue;
                }
                let g0 = mesh.height_at(&w[0]).unwrap_or(0.0);
                let g1 = mesh.height_at(&w[1]).unwrap_or(0.0);
                facets.push(Facet {
                    p0: w[0].with_z(g0),
                    p1: w[1].with_z(g1),
                    top_z0: top,
                    top_z1: top,
                    kind: ObstacleKind::Building,
                    origin: id,
                    alpha: b.alpha.clone(),
                });
            }
        }
        for (id, w) in builder.walls.iter().enumerate() {
            let g0 = mesh.height_at(&w.p0).unwrap_or(0.0);
            let g1 = mesh.height_at(&w.p1).unwrap_or(0.0);
            facets.push(Facet {
                p0: w.p0.with_z(g0),
                p1: w.p1.with_z(g1),
                top_z0: g0 + w.height,
                top_z1: g1 + w.height,
                kind: ObstacleKind::Wall,
                origin: id,
                alpha: w.alpha.clone(),
            });
        }

        let entries: Vec<FacetEntry> = facets
            .iter()
            .enumerate()
            .map(|(idx, f)| FacetEntry {
                idx,
                env: AABB::from_corners(
                    [f.p0.x.min(f.p1.x), f.p0.y.min(f.p1.y)],
                    [f.p0.x.max(f.p1.x), f.p0.y.max(f.p1.y)],
                ),
            })
            .collect();
        let facet_tree = RTree::bulk_load(entries);

        Ok(SceneIndex {
            mesh,
            buildings,
            ground_zones: builder.ground_zones.clone(),
            facets,
            facet_tree,
            roof_z,
            envelope: builder.envelope,
            default_g: builder.default_g,
        })
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn buildings(&self) -> &[Building] {
        &self.buildings
    }

    pub fn facets(&self) -> &[Facet] {
        &self.facets
    }

    pub fn facet(&self, idx: usize) -> &Facet {
        &self.facets[idx]
    }

    /// Absolute roof elevation of a merged building.
    pub fn roof_z(&self, building: usize) -> f64 {
        self.roof_z[building]
    }

    /// Ground elevation at `p`, if inside the triangulated domain.
    pub fn height_at(&self, p: &Coord) -> Option<f64> {
        self.mesh.height_at(p)
    }

    /// Building whose footprint contains the horizontal position of `p`.
    pub fn building_at(&self, p: &Coord) -> Option<usize> {
        self.mesh
            .triangle_at(p)
            .and_then(|t| self.mesh.triangles()[t].building)
    }

    /// Ground absorption coefficient at `p`. The last declared zone
    /// containing the point wins; outside every zone the builder's default
    /// applies.
    pub fn ground_g_at(&self, p: &Coord) -> f64 {
        let mut g = self.default_g;
        for zone in &self.ground_zones {
            if polygon_contains(&ring_to_polygon(&zone.ring), p) {
                g = zone.g;
            }
        }
        g
    }

    pub fn ground_zones(&self) -> &[GroundZone] {
        &self.ground_zones
    }

    /// Points where `[p1, p2]` crosses a terrain triangle edge, each with the
    /// interpolated ground elevation, ordered from `p1` to `p2`.
    ///
    /// Walks the mesh triangle by triangle through shared edges instead of
    /// querying the R-tree per step, so the cost is linear in the number of
    /// crossed triangles.
    pub fn terrain_crossings(&self, p1: &Coord, p2: &Coord) -> Vec<Coord> {
        if p1.distance_2d(p2) < EPSILON {
            return Vec::new();
        }
        let target = self.mesh.triangle_at(p2);
        // A start point on a shared edge belongs to several triangles, and
        // the tree may hand back the one behind the segment, where no
        // forward exit exists. Walk from every incident triangle and keep
        // the first walk that reaches the receiver triangle.
        let mut best: Vec<Coord> = Vec::new();
        for start in self.mesh.triangles_containing(p1) {
            let (crossings, reached) = self.walk_terrain(start, target, p1, p2);
            if reached {
                return crossings;
            }
            if crossings.len() > best.len() {
                best = crossings;
            }
        }
        best
    }

    /// One triangle-by-triangle walk from `start` toward `p2`. Returns the
    /// edge crossings found and whether the walk arrived (at the target
    /// triangle, or off the mesh hull past the segment end).
    fn walk_terrain(
        &self,
        start: usize,
        target: Option<usize>,
        p1: &Coord,
        p2: &Coord,
    ) -> (Vec<Coord>, bool) {
        let mut out = Vec::new();
        let mut cur = start;
        let mut prev: Option<usize> = None;
        let mut progress = -EPSILON;
        // The walk visits each triangle at most once.
        let max_steps = self.mesh.triangles().len() + 1;
        for _ in 0..max_steps {
            if Some(cur) == target {
                return (out, true);
            }
            let tri = &self.mesh.triangles()[cur];
            let coords = self.mesh.triangle_coords(cur);
            let mut exit: Option<(f64, Coord, Option<usize>)> = None;
            for i in 0..3 {
                let a = coords[i];
                let b = coords[(i + 1) % 3];
                let neighbor = tri.neighbors[i];
                if neighbor.is_some() && neighbor == prev {
                    continue;
                }
                if let Some(hit) = segment_intersection_2d(p1, p2, &a, &b) {
                    let t = projection_factor(&hit, p1, p2);
                    if t > progress + EPSILON
                        && exit.as_ref().map(|(bt, _, _)| t < *bt).unwrap_or(true)
                    {
                        let z = interpolate_z_on_segment(&hit, &a, &b);
                        exit = Some((t, hit.with_z(z), neighbor));
                    }
                }
            }
            let Some((t, crossing, neighbor)) = exit else {
                return (out, false);
            };
            out.push(crossing);
            progress = t;
            match neighbor {
                Some(n) => {
                    prev = Some(cur);
                    cur = n;
                }
                // Left the convex hull of the mesh.
                None => return (out, target.is_none() || t > 1.0 - EPSILON),
            }
        }
        (out, false)
    }

    /// Facets crossed by the horizontal projection of `[p1, p2]`, with the
    /// crossing point, ordered from `p1` to `p2`.
    pub fn facet_crossings(&self, p1: &Coord, p2: &Coord) -> Vec<(usize, Coord)> {
        let query = AABB::from_corners(
            [p1.x.min(p2.x), p1.y.min(p2.y)],
            [p1.x.max(p2.x), p1.y.max(p2.y)],
        );
        let mut out: Vec<(f64, usize, Coord)> = Vec::new();
        for entry in self.facet_tree.locate_in_envelope_intersecting(&query) {
            let f = &self.facets[entry.idx];
            if let Some(hit) = segment_intersection_2d(p1, p2, &f.p0, &f.p1) {
                let t = projection_factor(&hit, p1, p2);
                out.push((t, entry.idx, hit));
            }
        }
        out.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        out.into_iter().map(|(_, idx, p)| (idx, p)).collect()
    }

    /// Ground-zone boundary crossings along `[p1, p2]`, with the zone index,
    /// ordered from `p1` to `p2`.
    pub fn zone_crossings(&self, p1: &Coord, p2: &Coord) -> Vec<(usize, Coord)> {
        let mut out: Vec<(f64, usize, Coord)> = Vec::new();
        for (id, zone) in self.ground_zones.iter().enumerate() {
            for w in zone.ring.windows(2) {
                if let Some(hit) = segment_intersection_2d(p1, p2, &w[0], &w[1]) {
                    out.push((projection_factor(&hit, p1, p2), id, hit));
                }
            }
        }
        out.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        out.into_iter().map(|(_, id, p)| (id, p)).collect()
    }

    /// True iff the 3D segment `[p1, p2]` clears the terrain and every facet
    /// on its way. Crossings within [`ENDPOINT_SKIP`] of an endpoint are
    /// ignored so legs may start or end on a reflecting wall or a roof edge.
    pub fn is_free_field(&self, p1: &Coord, p2: &Coord) -> bool {
        for p in [p1, p2] {
            if let Some(b) = self.building_at(p) {
                if p.z < self.roof_z[b] - EPSILON {
                    return false;
                }
            }
        }

        let len = p1.distance_2d(p2);
        if len < EPSILON {
            return true;
        }

        for crossing in self.terrain_crossings(p1, p2) {
            let t = projection_factor(&crossing, p1, p2);
            let ray_z = p1.z + t * (p2.z - p1.z);
            if crossing.z > ray_z + EPSILON {
                return false;
            }
        }

        for (idx, hit) in self.facet_crossings(p1, p2) {
            if hit.distance_2d(p1) < ENDPOINT_SKIP || hit.distance_2d(p2) < ENDPOINT_SKIP {
                continue;
            }
            let t = projection_factor(&hit, p1, p2);
            let ray_z = p1.z + t * (p2.z - p1.z);
            if ray_z < self.facets[idx].top_z_at(&hit) - EPSILON {
                return false;
            }
        }
        true
    }

    /// Facets whose closest point lies within `max_dist` of `p`.
    pub fn facets_in_range(&self, p: &Coord, max_dist: f64) -> Vec<usize> {
        let query = AABB::from_corners(
            [p.x - max_dist, p.y - max_dist],
            [p.x + max_dist, p.y + max_dist],
        );
        self.facet_tree
            .locate_in_envelope_intersecting(&query)
            .filter(|e| {
                let f = &self.facets[e.idx];
                closest_point_on_segment(p, &f.p0, &f.p1).distance_2d(p) <= max_dist
            })
            .map(|e| e.idx)
            .collect()
    }

    /// Candidate vertical-diffraction corners of a merged building.
    ///
    /// A corner qualifies when its open (exterior) angle lies strictly
    /// between pi*17/16 and pi*29/16, so grazing and near-collinear corners
    /// are skipped. Each kept corner is pushed [`WIDE_ANGLE_OFFSET`] outward
    /// along the bisector and raised to the roof elevation.
    pub fn wide_angle_points(&self, building: usize) -> Vec<Coord> {
        let b = &self.buildings[building];
        let roof = self.roof_z[building];
        let mut ring: Vec<Coord> = b.ring.clone();
        // Work on a counter-clockwise open ring.
        let area: f64 = ring
            .windows(2)
            .map(|w| (w[0].x * w[1].y - w[1].x * w[0].y) / 2.0)
            .sum();
        if area < 0.0 {
            ring.reverse();
        }
        ring.pop();

        let n = ring.len();
        let mut out = Vec::new();
        // open angle = 2*pi - interior, so open in (pi*17/16, pi*31/16)
        // is interior in (pi/16, 15*pi/16).
        let lo = std::f64::consts::PI / 16.0;
        let hi = std::f64::consts::PI * 15.0 / 16.0;
        for i in 0..n {
            let prev = ring[(i + n - 1) % n];
            let v = ring[i];
            let next = ring[(i + 1) % n];
            // Reflex corners of a CCW ring turn right.
            if cross_2d(&prev, &v, &next) <= 0.0 {
                continue;
            }
            let (ax, ay) = (prev.x - v.x, prev.y - v.y);
            let (bx, by) = (next.x - v.x, next.y - v.y);
            let la = (ax * ax + ay * ay).sqrt();
            let lb = (bx * bx + by * by).sqrt();
            if la < EPSILON || lb < EPSILON {
                continue;
            }
            let interior = ((ax * bx + ay * by) / (la * lb)).clamp(-1.0, 1.0).acos();
            if interior <= lo || interior >= hi {
                continue;
            }
            // Outward bisector of a convex corner.
            let (mut ox, mut oy) = (-(ax / la + bx / lb), -(ay / la + by / lb));
            let lo_len = (ox * ox + oy * oy).sqrt();
            if lo_len < EPSILON {
                continue;
            }
            ox /= lo_len;
            oy /= lo_len;
            out.push(Coord::new(
                v.x + ox * WIDE_ANGLE_OFFSET,
                v.y + oy * WIDE_ANGLE_OFFSET,
                roof,
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_with_building() -> SceneIndex {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 100.0, 100.0));
        builder.add_building(
            vec![
                Coord::new(40.0, 40.0, 0.0),
                Coord::new(60.0, 40.0, 0.0),
                Coord::new(60.0, 60.0, 0.0),
                Coord::new(40.0, 60.0, 0.0),
            ],
            10.0,
            vec![0.2],
        );
        builder.build().unwrap()
    }

    #[test]
    fn segment_through_building_is_blocked() {
        let index = scene_with_building();
        let s = Coord::new(10.0, 50.0, 2.0);
        let r = Coord::new(90.0, 50.0, 2.0);
        assert!(!index.is_free_field(&s, &r));
    }

    #[test]
    fn segment_over_building_is_free() {
        let index = scene_with_building();
        let s = Coord::new(10.0, 50.0, 15.0);
        let r = Coord::new(90.0, 50.0, 15.0);
        assert!(index.is_free_field(&s, &r));
    }

    #[test]
    fn segment_beside_building_is_free() {
        let index = scene_with_building();
        let s = Coord::new(10.0, 10.0, 2.0);
        let r = Coord::new(90.0, 10.0, 2.0);
        assert!(index.is_free_field(&s, &r));
    }

    #[test]
    fn rectangular_building_has_four_wide_angle_corners() {
        let index = scene_with_building();
        let corners = index.wide_angle_points(0);
        assert_eq!(corners.len(), 4);
        for c in &corners {
            assert!((c.z - 10.0).abs() < 1e-9);
            // Pushed outside the footprint.
            assert!(index.building_at(c).is_none());
        }
    }

    #[test]
    fn sharp_convex_corner_keeps_its_diffraction_edge() {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 120.0, 100.0));
        // Wedge with a 14 degree tip at (40, 50).
        builder.add_building(
            vec![
                Coord::new(40.0, 50.0, 0.0),
                Coord::new(80.0, 45.0, 0.0),
                Coord::new(80.0, 55.0, 0.0),
            ],
            6.0,
            vec![],
        );
        let index = builder.build().unwrap();
        let corners = index.wide_angle_points(0);
        assert_eq!(corners.len(), 3);
        assert!(corners
            .iter()
            .any(|c| (c.x - 40.0).abs() < 0.1 && (c.y - 50.0).abs() < 0.1));
    }

    #[test]
    fn terrain_walk_survives_an_endpoint_on_a_triangle_edge() {
        // Flat until x = 120, 10 m climb to x = 185, plateau beyond. The
        // diagonal query starts on a shared triangle edge of the densified
        // breakline mesh.
        let mut builder = SceneBuilder::new(Envelope::new(-20.0, -20.0, 220.0, 100.0));
        builder
            .add_topo_line(Coord::new(-20.0, -20.0, 0.0), Coord::new(-20.0, 100.0, 0.0))
            .add_topo_line(Coord::new(120.0, -20.0, 0.0), Coord::new(120.0, 100.0, 0.0))
            .add_topo_line(Coord::new(185.0, -20.0, 10.0), Coord::new(185.0, 100.0, 10.0))
            .add_topo_line(Coord::new(220.0, -20.0, 10.0), Coord::new(220.0, 100.0, 10.0));
        let index = builder.build().unwrap();
        let s = Coord::new(10.0, 10.0, 1.0);
        let crossings = index.terrain_crossings(&s, &Coord::new(200.0, 50.0, 14.0));
        assert!(!crossings.is_empty());
        assert!(crossings.iter().any(|c| c.z > 1.0));
        // A ray grazing below the hillside is obstructed, one above is not.
        assert!(!index.is_free_field(&s, &Coord::new(200.0, 50.0, 10.5)));
        assert!(index.is_free_field(&s, &Coord::new(200.0, 50.0, 14.0)));
    }

    #[test]
    fn ground_g_respects_zone_boundaries() {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 100.0, 100.0));
        builder
            .add_ground_zone_rect(0.0, 50.0, 0.0, 100.0, 0.9)
            .default_g(0.1);
        let index = builder.build().unwrap();
        assert!((index.ground_g_at(&Coord::flat(25.0, 50.0)) - 0.9).abs() < 1e-12);
        assert!((index.ground_g_at(&Coord::flat(75.0, 50.0)) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn terrain_crossings_follow_a_slope() {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 100.0, 100.0));
        builder
            .add_topo_line(Coord::new(0.0, 0.0, 0.0), Coord::new(0.0, 100.0, 0.0))
            .add_topo_line(Coord::new(50.0, 0.0, 5.0), Coord::new(50.0, 100.0, 5.0))
            .add_topo_line(Coord::new(100.0, 0.0, 10.0), Coord::new(100.0, 100.0, 10.0));
        let index = builder.build().unwrap();
        let crossings =
            index.terrain_crossings(&Coord::new(5.0, 50.0, 0.0), &Coord::new(95.0, 50.0, 10.0));
        assert!(!crossings.is_empty());
        for c in &crossings {
            let expected = c.x / 10.0;
            assert!((c.z - expected).abs() < 1.0, "z at x={}: {}", c.x, c.z);
        }
    }

    #[test]
    fn wall_blocks_below_its_top() {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 100.0, 100.0));
        builder.add_wall(
            Coord::new(50.0, 0.0, 0.0),
            Coord::new(50.0, 100.0, 0.0),
            4.0,
            vec![],
        );
        let index = builder.build().unwrap();
        let s = Coord::new(10.0, 50.0, 1.0);
        let r = Coord::new(90.0, 50.0, 1.0);
        assert!(!index.is_free_field(&s, &r));
        assert!(index.is_free_field(&s.with_z(6.0), &r.with_z(6.0)));
    }
}
