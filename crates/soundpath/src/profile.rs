//! Cut profiles: the ordered trace of everything a source-receiver segment
//! crosses in the horizontal plane.
//!
//! A profile is the input of every ground-effect and obstruction decision
//! downstream. Points are ordered from source to receiver; each carries the
//! local ground elevation and the absorption coefficient of the ground
//! sub-segment that starts there.

use serde::{Deserialize, Serialize};

use crate::geom::{projection_factor, Coord, EPSILON};
use crate::index::SceneIndex;
use crate::scene::ObstacleKind;

/// What a cut point marks along the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CutPointKind {
    Source,
    Receiver,
    /// Crossing of a building facade; the coordinate sits at roof elevation.
    Building { id: usize },
    /// Crossing of a free-standing wall; the coordinate sits at the wall top.
    Wall { id: usize },
    /// Crossing of a terrain triangle edge, at ground elevation.
    Topography,
    /// Boundary of a ground-absorption zone.
    GroundEffect { zone: usize },
    /// Specular reflection point inserted by the reflection search,
    /// identified by the input feature it bounced off.
    Reflection { obstacle: ObstacleKind, origin: usize },
    /// Horizontal-edge (over-roof) diffraction point.
    DiffractionH,
    /// Vertical-edge (around-corner) diffraction point.
    DiffractionV,
}

/// One point of a cut profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutPoint {
    pub coord: Coord,
    pub kind: CutPointKind,
    /// Ground elevation directly below the point.
    pub ground_z: f64,
    /// Ground absorption of the sub-segment starting at this point.
    pub g: f64,
}

/// Ordered trace of a source-receiver segment through the scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutProfile {
    pub points: Vec<CutPoint>,
    /// True when some crossing rises above the straight source-receiver ray.
    pub blocked: bool,
}

impl CutProfile {
    pub fn source(&self) -> &CutPoint {
        &self.points[0]
    }

    pub fn receiver(&self) -> &CutPoint {
        &self.points[self.points.len() - 1]
    }

    /// Horizontal length of the profile.
    pub fn length_2d(&self) -> f64 {
        self.source().coord.distance_2d(&self.receiver().coord)
    }

    /// Ground absorption of the whole profile: the mean of the sub-segment
    /// coefficients weighted by horizontal sub-segment length.
    pub fn g_path(&self) -> f64 {
        let mut total = 0.0;
        let mut acc = 0.0;
        for w in self.points.windows(2) {
            let len = w[0].coord.distance_2d(&w[1].coord);
            acc += w[0].g * len;
            total += len;
        }
        if total < EPSILON {
            self.source().g
        } else {
            acc / total
        }
    }

    /// Terrain elevations under the profile, source to receiver, for the
    /// mean-plane regression.
    pub fn ground_points(&self) -> Vec<Coord> {
        self.points
            .iter()
            .map(|p| p.coord.with_z(p.ground_z))
            .collect()
    }
}

/// Segments longer than this are traced in chunks so the spatial queries
/// keep tight envelopes on long diagonal lines.
const MAX_CHUNK_LENGTH: f64 = 512.0;

/// Trace the segment from `source` to `receiver` through the scene.
///
/// Crossings of building facades, walls, terrain edges and ground-zone
/// boundaries are collected, ordered by distance from the source, and
/// deduplicated. Sub-segment absorption comes from sampling the zone map at
/// each sub-segment midpoint.
pub fn cut_profile(index: &SceneIndex, source: &Coord, receiver: &Coord) -> CutProfile {
    let mut raw: Vec<(f64, CutPoint)> = Vec::new();

    let ground_at = |p: &Coord| index.height_at(p).unwrap_or(0.0);

    raw.push((
        0.0,
        CutPoint {
            coord: *source,
            kind: CutPointKind::Source,
            ground_z: ground_at(source),
            g: 0.0,
        },
    ));
    raw.push((
        1.0,
        CutPoint {
            coord: *receiver,
            kind: CutPointKind::Receiver,
            ground_z: ground_at(receiver),
            g: 0.0,
        },
    ));

    let length = source.distance_2d(receiver);
    let chunks = (length / MAX_CHUNK_LENGTH).ceil().max(1.0) as usize;
    for c in 0..chunks {
        let f0 = c as f64 / chunks as f64;
        let f1 = (c + 1) as f64 / chunks as f64;
        let a = lerp(source, receiver, f0);
        let b = lerp(source, receiver, f1);

        for (idx, hit) in index.facet_crossings(&a, &b) {
            let facet = index.facet(idx);
            let kind = match facet.kind {
                ObstacleKind::Building => CutPointKind::Building { id: facet.origin },
                ObstacleKind::Wall => CutPointKind::Wall { id: facet.origin },
                ObstacleKind::Topography => CutPointKind::Topography,
            };
            raw.push((
                projection_factor(&hit, source, receiver),
                CutPoint {
                    coord: hit.with_z(facet.top_z_at(&hit)),
                    kind,
                    ground_z: ground_at(&hit),
                    g: 0.0,
                },
            ));
        }

        for crossing in index.terrain_crossings(&a, &b) {
            raw.push((
                projection_factor(&crossing, source, receiver),
                CutPoint {
                    coord: crossing,
                    kind: CutPointKind::Topography,
                    ground_z: crossing.z,
                    g: 0.0,
                },
            ));
        }

        for (zone, hit) in index.zone_crossings(&a, &b) {
            let gz = ground_at(&hit);
            raw.push((
                projection_factor(&hit, source, receiver),
                CutPoint {
                    coord: hit.with_z(gz),
                    kind: CutPointKind::GroundEffect { zone },
                    ground_z: gz,
                    g: 0.0,
                },
            ));
        }
    }

    raw.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    // Collapse crossings that landed on the same spot, keeping the higher
    // obstruction.
    let mut points: Vec<CutPoint> = Vec::with_capacity(raw.len());
    for (_, p) in raw {
        if let Some(last) = points.last_mut() {
            if last.coord.distance_2d(&p.coord) < 1e-9
                && last.kind != CutPointKind::Source
                && p.kind != CutPointKind::Receiver
            {
                if p.coord.z > last.coord.z || last.kind == CutPointKind::Topography {
                    *last = p;
                }
                continue;
            }
        }
        points.push(p);
    }

    // Sub-segment absorption by midpoint sampling.
    let n = points.len();
    for i in 0..n {
        let g = if i + 1 < n {
            let a = points[i].coord;
            let b = points[i + 1].coord;
            let mid = Coord::flat((a.x + b.x) / 2.0, (a.y + b.y) / 2.0);
            index.ground_g_at(&mid)
        } else {
            index.ground_g_at(&points[i].coord)
        };
        points[i].g = g;
    }

    let blocked = points.iter().skip(1).take(n.saturating_sub(2)).any(|p| {
        let t = projection_factor(&p.coord, source, receiver);
        let ray_z = source.z + t * (receiver.z - source.z);
        p.coord.z > ray_z + EPSILON
    });

    CutProfile { points, blocked }
}

fn lerp(a: &Coord, b: &Coord, f: f64) -> Coord {
    Coord::new(
        a.x + f * (b.x - a.x),
        a.y + f * (b.y - a.y),
        a.z + f * (b.z - a.z),
    )
}
