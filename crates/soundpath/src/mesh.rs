//! Triangulated irregular network over a cell envelope.
//!
//! The mesh owns every vertex in a single arena; triangles reference vertices
//! by index, never by pointer, so the structure is immutable after build and
//! safe to share read-only across worker threads. Neighbor links come from
//! the delaunator halfedge table. Each triangle carries the id of the
//! building footprint containing its centroid, if any.

use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;

use crate::error::{Result, SoundPathError};
use crate::geom::{interpolate_z_in_triangle, point_in_triangle, Coord, Envelope};
use crate::scene::{polygon_contains, ring_to_polygon, Building, SceneBuilder};

/// One mesh triangle: vertex indices, neighbor triangle across each edge,
/// and the owning building footprint (`None` = open ground).
///
/// Edge `i` runs from `vertices[i]` to `vertices[(i + 1) % 3]`;
/// `neighbors[i]` is the triangle sharing that edge.
#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    pub vertices: [usize; 3],
    pub neighbors: [Option<usize>; 3],
    pub building: Option<usize>,
}

#[derive(Debug, Clone)]
struct TriEntry {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for TriEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

/// Immutable terrain mesh with spatial index.
pub struct Mesh {
    vertices: Vec<Coord>,
    triangles: Vec<Triangle>,
    tree: RTree<TriEntry>,
}

impl Mesh {
    /// Triangulate the scene geometry over its envelope.
    ///
    /// Constraint edges (building rings, topographic breaklines, ground-zone
    /// boundaries) are densified with Steiner points at the builder's
    /// densify interval so the Delaunay triangulation follows them closely.
    /// Vertices without an explicit elevation get theirs interpolated from a
    /// topography-only pre-triangulation.
    pub fn build(builder: &SceneBuilder, merged_buildings: &[Building]) -> Result<Mesh> {
        let step = builder.densify_interval;

        // Topographic vertices carry their own elevation.
        let mut topo_pts: Vec<Coord> = builder.topo_points.clone();
        for (p0, p1) in &builder.topo_lines {
            densify_into(p0, p1, step, &mut topo_pts);
        }
        let topo_mesh = triangulate_raw(&topo_pts).ok();

        let ground_z = |p: &Coord| -> f64 {
            topo_mesh
                .as_ref()
                .and_then(|m| m.interpolate(p))
                .unwrap_or_else(|| nearest_z(&topo_pts, p))
        };

        // Remaining constraint vertices sit on the ground surface.
        let mut points: Vec<Coord> = Vec::new();
        for p in &topo_pts {
            points.push(*p);
        }
        let env = builder.envelope;
        for corner in [
            Coord::flat(env.min_x, env.min_y),
            Coord::flat(env.max_x, env.min_y),
            Coord::flat(env.max_x, env.max_y),
            Coord::flat(env.min_x, env.max_y),
        ] {
            points.push(corner.with_z(ground_z(&corner)));
        }
        for b in merged_buildings {
            for w in b.ring.windows(2) {
                let mut edge = Vec::new();
                densify_into(&w[0], &w[1], step, &mut edge);
                for p in edge {
                    points.push(p.with_z(ground_z(&p)));
                }
            }
        }
        for z in &builder.ground_zones {
            for w in z.ring.windows(2) {
                let mut edge = Vec::new();
                densify_into(&w[0], &w[1], step, &mut edge);
                for p in edge {
                    points.push(p.with_z(ground_z(&p)));
                }
            }
        }
        for w in &builder.walls {
            points.push(w.p0.with_z(ground_z(&w.p0)));
            points.push(w.p1.with_z(ground_z(&w.p1)));
        }

        let raw = triangulate_raw(&points)?;
        let RawMesh {
            vertices,
            tri_indices,
            halfedges,
        } = raw;

        let footprints: Vec<_> = merged_buildings
            .iter()
            .map(|b| ring_to_polygon(&b.ring))
            .collect();

        let tri_count = tri_indices.len() / 3;
        let mut triangles: Vec<Triangle> = (0..tri_count)
            .map(|t| {
                let v = [
                    tri_indices[3 * t],
                    tri_indices[3 * t + 1],
                    tri_indices[3 * t + 2],
                ];
                let n = [
                    neighbor_of(&halfedges, 3 * t),
                    neighbor_of(&halfedges, 3 * t + 1),
                    neighbor_of(&halfedges, 3 * t + 2),
                ];
                Triangle {
                    vertices: v,
                    neighbors: n,
                    building: None,
                }
            })
            .collect();

        // Owning-building attribution by centroid containment.
        if !footprints.is_empty() {
            triangles.par_iter_mut().for_each(|tri| {
                let a = vertices[tri.vertices[0]];
                let b = vertices[tri.vertices[1]];
                let c = vertices[tri.vertices[2]];
                let centroid = Coord::flat((a.x + b.x + c.x) / 3.0, (a.y + b.y + c.y) / 3.0);
                tri.building = footprints
                    .iter()
                    .position(|f| polygon_contains(f, &centroid));
            });
        }

        let entries: Vec<TriEntry> = triangles
            .iter()
            .enumerate()
            .map(|(idx, tri)| {
                let mut env = Envelope::empty();
                for &v in &tri.vertices {
                    env.expand_to_include(&vertices[v]);
                }
                TriEntry {
                    idx,
                    env: AABB::from_corners([env.min_x, env.min_y], [env.max_x, env.max_y]),
                }
            })
            .collect();
        let tree = RTree::bulk_load(entries);

        Ok(Mesh {
            vertices,
            triangles,
            tree,
        })
    }

    pub fn vertices(&self) -> &[Coord] {
        &self.vertices
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    /// Corner coordinates of a triangle.
    pub fn triangle_coords(&self, idx: usize) -> [Coord; 3] {
        let t = &self.triangles[idx];
        [
            self.vertices[t.vertices[0]],
            self.vertices[t.vertices[1]],
            self.vertices[t.vertices[2]],
        ]
    }

    /// Triangle containing the horizontal position of `p`.
    pub fn triangle_at(&self, p: &Coord) -> Option<usize> {
        let query = AABB::from_point([p.x, p.y]);
        for entry in self.tree.locate_in_envelope_intersecting(&query) {
            let [a, b, c] = self.triangle_coords(entry.idx);
            if point_in_triangle(p, &a, &b, &c) {
                return Some(entry.idx);
            }
        }
        None
    }

    /// Every triangle whose closure contains the horizontal position of `p`.
    /// A point on a shared edge or vertex belongs to each incident triangle.
    pub fn triangles_containing(&self, p: &Coord) -> Vec<usize> {
        let query = AABB::from_point([p.x, p.y]);
        self.tree
            .locate_in_envelope_intersecting(&query)
            .filter(|e| {
                let [a, b, c] = self.triangle_coords(e.idx);
                point_in_triangle(p, &a, &b, &c)
            })
            .map(|e| e.idx)
            .collect()
    }

    /// Triangles whose bounding box intersects `env`.
    pub fn triangles_in_envelope(&self, env: &Envelope) -> impl Iterator<Item = usize> + '_ {
        let query = AABB::from_corners([env.min_x, env.min_y], [env.max_x, env.max_y]);
        self.tree
            .locate_in_envelope_intersecting(&query)
            .map(|e| e.idx)
    }

    /// Ground elevation at `p`, interpolated in the containing triangle.
    pub fn height_at(&self, p: &Coord) -> Option<f64> {
        let idx = self.triangle_at(p)?;
        let [a, b, c] = self.triangle_coords(idx);
        Some(interpolate_z_in_triangle(p, &a, &b, &c))
    }
}

struct RawMesh {
    vertices: Vec<Coord>,
    tri_indices: Vec<usize>,
    halfedges: Vec<usize>,
}

impl RawMesh {
    fn interpolate(&self, p: &Coord) -> Option<f64> {
        let tri_count = self.tri_indices.len() / 3;
        for t in 0..tri_count {
            let a = self.vertices[self.tri_indices[3 * t]];
            let b = self.vertices[self.tri_indices[3 * t + 1]];
            let c = self.vertices[self.tri_indices[3 * t + 2]];
            if point_in_triangle(p, &a, &b, &c) {
                return Some(interpolate_z_in_triangle(p, &a, &b, &c));
            }
        }
        None
    }
}

/// Delaunay triangulation of a deduplicated point set.
fn triangulate_raw(points: &[Coord]) -> Result<RawMesh> {
    let mut unique: Vec<Coord> = Vec::with_capacity(points.len());
    let mut seen: HashMap<(i64, i64), usize> = HashMap::new();
    for p in points {
        let key = (quantize(p.x), quantize(p.y));
        if let std::collections::hash_map::Entry::Vacant(e) = seen.entry(key) {
            e.insert(unique.len());
            unique.push(*p);
        }
    }
    if unique.len() < 3 {
        return Err(SoundPathError::MeshBuild {
            message: format!("{} unique vertices, at least 3 required", unique.len()),
        });
    }
    let flat: Vec<delaunator::Point> = unique
        .iter()
        .map(|p| delaunator::Point { x: p.x, y: p.y })
        .collect();
    let triangulation = delaunator::triangulate(&flat);
    if triangulation.triangles.is_empty() {
        return Err(SoundPathError::MeshBuild {
            message: "triangulation produced no triangles (collinear input?)".into(),
        });
    }
    Ok(RawMesh {
        vertices: unique,
        tri_indices: triangulation.triangles,
        halfedges: triangulation.halfedges,
    })
}

fn neighbor_of(halfedges: &[usize], edge: usize) -> Option<usize> {
    let twin = halfedges[edge];
    if twin == delaunator::EMPTY {
        None
    } else {
        Some(twin / 3)
    }
}

fn quantize(v: f64) -> i64 {
    (v * 1e6).round() as i64
}

/// Append `p0` and interior Steiner points toward `p1` (exclusive) at most
/// `step` apart, z interpolated linearly.
fn densify_into(p0: &Coord, p1: &Coord, step: f64, out: &mut Vec<Coord>) {
    let len = p0.distance_2d(p1);
    let n = (len / step).ceil().max(1.0) as usize;
    for i in 0..n {
        let f = i as f64 / n as f64;
        out.push(Coord::new(
            p0.x + f * (p1.x - p0.x),
            p0.y + f * (p1.y - p0.y),
            p0.z + f * (p1.z - p0.z),
        ));
    }
    out.push(*p1);
}

fn nearest_z(topo: &[Coord], p: &Coord) -> f64 {
    topo.iter()
        .min_by(|a, b| {
            a.distance_2d(p)
                .partial_cmp(&b.distance_2d(p))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.z)
        .unwrap_or(0.0)
}
