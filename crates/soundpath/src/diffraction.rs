//! Diffracted path search.
//!
//! Two families of diffracted paths exist: over horizontal roof edges
//! (rubber band stretched above the cut profile) and around vertical
//! building corners (convex side hulls in the horizontal plane).

use std::collections::HashSet;

use crate::geom::{
    convex_hull, cross_2d, projection_factor, ring_length, Coord, EPSILON,
};
use crate::index::SceneIndex;
use crate::profile::{CutPointKind, CutProfile};
use crate::scene::ObstacleKind;

/// A side hull whose perimeter exceeds this many times the direct distance
/// is discarded as acoustically irrelevant.
pub const MAX_RATIO_HULL_DIRECT_PATH: f64 = 4.0;

/// Hard cap on hull growth iterations; dense scenes converge far earlier.
const MAX_HULL_ITERATIONS: usize = 100;

/// Offset pushing wall endpoints past the wall tip so hull legs clear the
/// wall itself.
const WALL_TIP_OFFSET: f64 = 0.01;

/// Over-roof diffraction chain from source to receiver.
///
/// Stretches a rubber band above the profile in the unfolded vertical plane:
/// the upper convex envelope of the cut points. Interior vertices of that
/// envelope are the horizontal diffraction edges. Returns `None` when the
/// profile is not blocked (the direct path stands) or when no obstruction
/// point ends up on the envelope.
pub fn over_roof_chain(profile: &CutProfile) -> Option<Vec<Coord>> {
    if !profile.blocked {
        return None;
    }
    let src = profile.source().coord;

    // (distance along profile, elevation, index into profile points)
    let mut flat: Vec<(f64, f64, usize)> = Vec::with_capacity(profile.points.len());
    for (i, p) in profile.points.iter().enumerate() {
        flat.push((src.distance_2d(&p.coord), p.coord.z, i));
    }

    // Upper convex chain: only clockwise turns survive.
    let mut chain: Vec<(f64, f64, usize)> = Vec::new();
    for &p in &flat {
        while chain.len() >= 2 {
            let a = chain[chain.len() - 2];
            let b = chain[chain.len() - 1];
            let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
            if cross >= 0.0 {
                chain.pop();
            } else {
                break;
            }
        }
        chain.push(p);
    }

    if chain.len() < 3 {
        return None;
    }
    // Every interior vertex must be a real obstruction, not a grazing
    // source or receiver duplicate.
    let interior_ok = chain[1..chain.len() - 1].iter().all(|&(_, _, i)| {
        matches!(
            profile.points[i].kind,
            CutPointKind::Building { .. } | CutPointKind::Wall { .. } | CutPointKind::Topography
        )
    });
    if !interior_ok {
        return None;
    }

    Some(
        chain
            .into_iter()
            .map(|(_, _, i)| profile.points[i].coord)
            .collect(),
    )
}

/// Convex side hull around the obstacles between `p1` and `p2`.
///
/// Grows iteratively: starting from the endpoints, every hull edge that
/// still crosses an obstacle rising above the `p1`-`p2` cut plane
/// contributes that obstacle's wide-angle corners, until the hull is
/// obstacle-free on the chosen side. Returns the chain of hull vertices from
/// `p1` to `p2` on the left (or right) side, or `None` when the hull blows
/// past [`MAX_RATIO_HULL_DIRECT_PATH`] or an endpoint falls inside the hull.
pub fn side_hull(index: &SceneIndex, p1: &Coord, p2: &Coord, left: bool) -> Option<Vec<Coord>> {
    let direct = p1.distance_2d(p2);
    if direct < EPSILON {
        return None;
    }

    let cut_plane_z = |p: &Coord| -> f64 {
        let t = projection_factor(p, p1, p2);
        p1.z + t * (p2.z - p1.z)
    };

    let mut points: Vec<Coord> = vec![*p1, *p2];
    let mut seen: HashSet<(i64, i64)> = points.iter().map(quantize).collect();
    let mut seen_facets: HashSet<usize> = HashSet::new();

    for _ in 0..MAX_HULL_ITERATIONS {
        let hull = convex_hull(&points);
        if ring_length(&hull) > MAX_RATIO_HULL_DIRECT_PATH * direct {
            return None;
        }

        let mut grew = false;
        for w in hull.windows(2) {
            for (idx, hit) in index.facet_crossings(&w[0], &w[1]) {
                if !seen_facets.insert(idx) {
                    continue;
                }
                let facet = index.facet(idx);
                if facet.top_z_at(&hit) <= cut_plane_z(&hit) + EPSILON {
                    continue;
                }
                let corners = match facet.kind {
                    ObstacleKind::Building => index.wide_angle_points(facet.origin),
                    ObstacleKind::Wall => wall_tips(facet.p0, facet.p1, facet.top_z0, facet.top_z1),
                    ObstacleKind::Topography => continue,
                };
                for c in corners {
                    if c.z <= cut_plane_z(&c) + EPSILON {
                        continue;
                    }
                    if seen.insert(quantize(&c)) {
                        points.push(c);
                        grew = true;
                    }
                }
            }
        }
        if !grew {
            break;
        }
    }

    let hull = convex_hull(&points);
    if ring_length(&hull) > MAX_RATIO_HULL_DIRECT_PATH * direct {
        return None;
    }
    split_hull(&hull, p1, p2, left)
}

/// Both vertical-edge diffraction chains between `source` and `receiver`,
/// validated leg by leg.
///
/// Interior corner elevations are interpolated along the unfolded chain so
/// the path climbs steadily from the source height to the receiver height.
pub fn vertical_edge_chains(
    index: &SceneIndex,
    source: &Coord,
    receiver: &Coord,
) -> Vec<Vec<Coord>> {
    let mut out = Vec::new();
    for left in [true, false] {
        let Some(mut chain) = side_hull(index, source, receiver, left) else {
            continue;
        };
        if chain.len() < 3 {
            continue; // same as the direct path
        }
        interpolate_chain_z(&mut chain, source.z, receiver.z);
        let valid = chain
            .windows(2)
            .all(|w| index.is_free_field(&w[0], &w[1]));
        if valid {
            out.push(chain);
        }
    }
    out
}

/// Assign elevations along a horizontal chain by linear interpolation over
/// the cumulative horizontal distance.
fn interpolate_chain_z(chain: &mut [Coord], z0: f64, z1: f64) {
    let mut cumulative = vec![0.0; chain.len()];
    for i in 1..chain.len() {
        cumulative[i] = cumulative[i - 1] + chain[i - 1].distance_2d(&chain[i]);
    }
    let total = cumulative[chain.len() - 1];
    if total < EPSILON {
        return;
    }
    for i in 1..chain.len() - 1 {
        chain[i].z = z0 + (z1 - z0) * cumulative[i] / total;
    }
    chain[0].z = z0;
    chain[chain.len() - 1].z = z1;
}

/// Extract the chain of hull vertices from `p1` to `p2` lying on the
/// requested side. `None` when an endpoint is not a hull vertex (an endpoint
/// swallowed by the hull means no side path exists there).
fn split_hull(hull: &[Coord], p1: &Coord, p2: &Coord, left: bool) -> Option<Vec<Coord>> {
    let ring = &hull[..hull.len().saturating_sub(1)];
    let n = ring.len();
    if n < 2 {
        return None;
    }
    let i1 = ring.iter().position(|p| p.distance_2d(p1) < 1e-9)?;
    let i2 = ring.iter().position(|p| p.distance_2d(p2) < 1e-9)?;

    let mut forward = Vec::new();
    let mut i = i1;
    loop {
        forward.push(ring[i]);
        if i == i2 {
            break;
        }
        i = (i + 1) % n;
    }
    let mut backward = Vec::new();
    let mut i = i1;
    loop {
        backward.push(ring[i]);
        if i == i2 {
            break;
        }
        i = (i + n - 1) % n;
    }

    for chain in [forward, backward] {
        if chain_is_on_side(&chain, p1, p2, left) {
            return Some(chain);
        }
    }
    None
}

/// True when every interior vertex of the chain lies on the requested side
/// of the `p1`-`p2` line. A two-point chain (no interior vertex) counts for
/// either side.
fn chain_is_on_side(chain: &[Coord], p1: &Coord, p2: &Coord, left: bool) -> bool {
    chain[1..chain.len().saturating_sub(1)].iter().all(|v| {
        let c = cross_2d(p1, p2, v);
        if left {
            c > -EPSILON
        } else {
            c < EPSILON
        }
    })
}

fn wall_tips(p0: Coord, p1: Coord, top0: f64, top1: f64) -> Vec<Coord> {
    let len = p0.distance_2d(&p1);
    if len < EPSILON {
        return vec![];
    }
    let (ux, uy) = ((p1.x - p0.x) / len, (p1.y - p0.y) / len);
    vec![
        Coord::new(p0.x - ux * WALL_TIP_OFFSET, p0.y - uy * WALL_TIP_OFFSET, top0),
        Coord::new(p1.x + ux * WALL_TIP_OFFSET, p1.y + uy * WALL_TIP_OFFSET, top1),
    ]
}

fn quantize(p: &Coord) -> (i64, i64) {
    ((p.x * 1e6).round() as i64, (p.y * 1e6).round() as i64)
}
