//! Specular reflection search by the image-receiver method.
//!
//! The receiver is mirrored across every candidate facet, recursively up to
//! the requested reflection order. Each mirror carries a visibility cone:
//! the fan of directions from which the mirror can actually be reached
//! through its wall segment. Sources outside the cone are rejected before
//! any geometry is traced.

use log::debug;

use crate::geom::{cross_2d, mirror_point, projection_factor, segment_intersection_2d, Coord, EPSILON};
use crate::index::SceneIndex;
use crate::scene::{polygon_contains, ring_to_polygon};

/// Angular step of the visibility cone arc discretization.
pub const DEFAULT_CIRCLE_POINT_ANGLE: f64 = std::f64::consts::PI / 24.0;

/// Hard cap on the mirror-receiver arena, all depths included.
pub const MAX_MIRRORS: usize = 50_000;

/// One image of the receiver through a chain of facets.
#[derive(Debug, Clone)]
pub struct MirrorReceiver {
    pub position: Coord,
    pub facet: usize,
    pub parent: Option<usize>,
    pub depth: usize,
    /// Visibility cone in the horizontal plane, closed ring.
    cone: Vec<Coord>,
}

/// Arena of mirror receivers for one receiver position.
pub struct MirrorReceiverIndex {
    mirrors: Vec<MirrorReceiver>,
    receiver: Coord,
}

impl MirrorReceiverIndex {
    /// Mirror the receiver across every facet within `max_dist`, breadth
    /// first up to `order` reflections.
    pub fn build(index: &SceneIndex, receiver: &Coord, order: usize, max_dist: f64) -> Self {
        let mut mirrors: Vec<MirrorReceiver> = Vec::new();
        if order == 0 {
            return Self {
                mirrors,
                receiver: *receiver,
            };
        }
        let cone_radius = 3.0 * max_dist;
        let candidates = index.facets_in_range(receiver, max_dist);

        let mut frontier: Vec<usize> = Vec::new();
        for &f in &candidates {
            let facet = index.facet(f);
            if cross_2d(&facet.p0, &facet.p1, receiver).abs() < EPSILON {
                continue; // receiver on the wall line, no image
            }
            let pos = mirror_point(receiver, &facet.p0, &facet.p1);
            let cone = visibility_cone(&pos, &facet.p0, &facet.p1, cone_radius);
            mirrors.push(MirrorReceiver {
                position: pos,
                facet: f,
                parent: None,
                depth: 1,
                cone,
            });
            frontier.push(mirrors.len() - 1);
        }

        for depth in 2..=order {
            let mut next = Vec::new();
            for &parent_idx in &frontier {
                if mirrors.len() >= MAX_MIRRORS {
                    debug!("mirror receiver capacity reached at depth {depth}");
                    break;
                }
                let parent = mirrors[parent_idx].clone();
                for &f in &candidates {
                    if f == parent.facet {
                        continue;
                    }
                    let facet = index.facet(f);
                    // The child wall must be at least partly visible through
                    // the parent cone.
                    if !segment_touches_ring(&facet.p0, &facet.p1, &parent.cone) {
                        continue;
                    }
                    if cross_2d(&facet.p0, &facet.p1, &parent.position).abs() < EPSILON {
                        continue;
                    }
                    let pos = mirror_point(&parent.position, &facet.p0, &facet.p1);
                    let cone = visibility_cone(&pos, &facet.p0, &facet.p1, cone_radius);
                    mirrors.push(MirrorReceiver {
                        position: pos,
                        facet: f,
                        parent: Some(parent_idx),
                        depth,
                        cone,
                    });
                    next.push(mirrors.len() - 1);
                    if mirrors.len() >= MAX_MIRRORS {
                        break;
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        Self {
            mirrors,
            receiver: *receiver,
        }
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    /// Mirrors whose visibility cone contains the source.
    pub fn visible_from<'a>(
        &'a self,
        source: &'a Coord,
    ) -> impl Iterator<Item = &'a MirrorReceiver> + 'a {
        self.mirrors
            .iter()
            .filter(move |m| polygon_contains(&ring_to_polygon(&m.cone), source))
    }

    /// Facet chain of a mirror, deepest reflection first.
    fn chain<'a>(&'a self, mirror: &'a MirrorReceiver) -> Vec<&'a MirrorReceiver> {
        let mut out = vec![mirror];
        let mut cur = mirror;
        while let Some(p) = cur.parent {
            cur = &self.mirrors[p];
            out.push(cur);
        }
        out
    }
}

/// A validated reflected path: the full point chain from source to receiver
/// and the facet reflected on at each interior point.
#[derive(Debug, Clone)]
pub struct ReflectionChain {
    pub points: Vec<Coord>,
    pub facets: Vec<usize>,
}

/// All validated reflected paths from `source` to `receiver` up to the given
/// reflection order.
pub fn reflection_chains(
    index: &SceneIndex,
    source: &Coord,
    receiver: &Coord,
    order: usize,
    max_dist: f64,
) -> Vec<ReflectionChain> {
    let mirror_index = MirrorReceiverIndex::build(index, receiver, order, max_dist);
    reflection_chains_with(index, source, &mirror_index)
}

/// Same as [`reflection_chains`], reusing a prebuilt mirror index. The grid
/// scheduler builds the index once per receiver and probes every source
/// against it.
pub fn reflection_chains_with(
    index: &SceneIndex,
    source: &Coord,
    mirror_index: &MirrorReceiverIndex,
) -> Vec<ReflectionChain> {
    let receiver = mirror_index.receiver;
    let mut out = Vec::new();

    for mirror in mirror_index.visible_from(source) {
        let chain = mirror_index.chain(mirror);

        // Back-walk the image chain: intersect each leg with its wall.
        let mut points: Vec<Coord> = vec![*source];
        let mut facets: Vec<usize> = Vec::new();
        let mut ok = true;
        let mut from = *source;
        for m in &chain {
            let facet = index.facet(m.facet);
            let Some(hit) = segment_intersection_2d(&from, &m.position, &facet.p0, &facet.p1)
            else {
                ok = false;
                break;
            };
            // Reflection point must fall strictly inside the finite wall.
            let f = projection_factor(&hit, &facet.p0, &facet.p1);
            if !(EPSILON..=1.0 - EPSILON).contains(&f) {
                ok = false;
                break;
            }
            points.push(hit);
            facets.push(m.facet);
            from = hit;
        }
        if !ok {
            continue;
        }
        points.push(receiver);

        assign_chain_z(&mut points, source.z, receiver.z);

        if !validate_chain(index, &points, &facets) {
            continue;
        }
        out.push(ReflectionChain { points, facets });
    }
    out
}

/// Interpolate interior elevations over the cumulative horizontal distance.
fn assign_chain_z(points: &mut [Coord], z0: f64, z1: f64) {
    let n = points.len();
    let mut cumulative = vec![0.0; n];
    for i in 1..n {
        cumulative[i] = cumulative[i - 1] + points[i - 1].distance_2d(&points[i]);
    }
    let total = cumulative[n - 1];
    if total < EPSILON {
        return;
    }
    for i in 1..n - 1 {
        points[i].z = z0 + (z1 - z0) * cumulative[i] / total;
    }
    points[0].z = z0;
    points[n - 1].z = z1;
}

/// Height bounds on every reflection point, same-side test around every
/// wall, and a free-field recheck of every leg.
fn validate_chain(index: &SceneIndex, points: &[Coord], facets: &[usize]) -> bool {
    for (i, &f) in facets.iter().enumerate() {
        let facet = index.facet(f);
        let q = points[i + 1];
        let base = index.height_at(&q).unwrap_or(0.0);
        if q.z < base - EPSILON || q.z > facet.top_z_at(&q) + EPSILON {
            return false;
        }
        // Incoming and outgoing points on the same side of the wall.
        let before = cross_2d(&facet.p0, &facet.p1, &points[i]);
        let after = cross_2d(&facet.p0, &facet.p1, &points[i + 2]);
        if before * after <= 0.0 {
            return false;
        }
    }
    points
        .windows(2)
        .all(|w| index.is_free_field(&w[0], &w[1]))
}

/// Fan polygon of directions reaching `mirror` through the wall `[a, b]`,
/// closed ring. The arc between the two wall-end directions is sampled
/// every [`DEFAULT_CIRCLE_POINT_ANGLE`].
fn visibility_cone(mirror: &Coord, a: &Coord, b: &Coord, radius: f64) -> Vec<Coord> {
    let da = (a.y - mirror.y).atan2(a.x - mirror.x);
    let db = (b.y - mirror.y).atan2(b.x - mirror.x);
    let mut sweep = db - da;
    while sweep > std::f64::consts::PI {
        sweep -= 2.0 * std::f64::consts::PI;
    }
    while sweep < -std::f64::consts::PI {
        sweep += 2.0 * std::f64::consts::PI;
    }

    let mut ring: Vec<Coord> = vec![*a];
    let steps = (sweep.abs() / DEFAULT_CIRCLE_POINT_ANGLE).ceil().max(1.0) as usize;
    for i in 0..=steps {
        let ang = da + sweep * i as f64 / steps as f64;
        ring.push(Coord::flat(
            mirror.x + radius * ang.cos(),
            mirror.y + radius * ang.sin(),
        ));
    }
    ring.push(*b);
    ring.push(*a);
    ring
}

/// True when the segment has a point inside or on the ring.
fn segment_touches_ring(p0: &Coord, p1: &Coord, ring: &[Coord]) -> bool {
    let poly = ring_to_polygon(ring);
    if polygon_contains(&poly, p0) || polygon_contains(&poly, p1) {
        return true;
    }
    ring.windows(2)
        .any(|w| segment_intersection_2d(p0, p1, &w[0], &w[1]).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Envelope;
    use crate::scene::SceneBuilder;

    fn wall_scene() -> SceneIndex {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 100.0, 100.0));
        builder.add_wall(
            Coord::new(50.0, 0.0, 0.0),
            Coord::new(50.0, 100.0, 0.0),
            10.0,
            vec![0.1],
        );
        builder.build().unwrap()
    }

    #[test]
    fn single_wall_gives_one_specular_path() {
        let index = wall_scene();
        let s = Coord::new(10.0, 30.0, 2.0);
        let r = Coord::new(10.0, 70.0, 2.0);
        let chains = reflection_chains(&index, &s, &r, 1, 200.0);
        assert_eq!(chains.len(), 1);
        let q = chains[0].points[1];
        assert!((q.x - 50.0).abs() < 1e-9);
        assert!((q.y - 50.0).abs() < 1e-6);
        assert!((q.z - 2.0).abs() < 1e-9);
    }

    #[test]
    fn order_zero_gives_no_paths() {
        let index = wall_scene();
        let s = Coord::new(10.0, 30.0, 2.0);
        let r = Coord::new(10.0, 70.0, 2.0);
        assert!(reflection_chains(&index, &s, &r, 0, 200.0).is_empty());
    }

    #[test]
    fn reflection_point_above_wall_top_is_rejected() {
        let index = wall_scene();
        // Geometric image exists but the midpoint of the path sits above the
        // 10 m wall.
        let s = Coord::new(10.0, 30.0, 18.0);
        let r = Coord::new(10.0, 70.0, 18.0);
        assert!(reflection_chains(&index, &s, &r, 1, 200.0).is_empty());
    }

    #[test]
    fn source_behind_the_wall_is_rejected() {
        let index = wall_scene();
        let s = Coord::new(90.0, 30.0, 2.0);
        let r = Coord::new(10.0, 70.0, 2.0);
        assert!(reflection_chains(&index, &s, &r, 1, 200.0).is_empty());
    }

    #[test]
    fn two_parallel_walls_give_a_second_order_path() {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 100.0, 100.0));
        builder
            .add_wall(
                Coord::new(30.0, 0.0, 0.0),
                Coord::new(30.0, 100.0, 0.0),
                10.0,
                vec![],
            )
            .add_wall(
                Coord::new(70.0, 0.0, 0.0),
                Coord::new(70.0, 100.0, 0.0),
                10.0,
                vec![],
            );
        let index = builder.build().unwrap();
        let s = Coord::new(40.0, 20.0, 2.0);
        let r = Coord::new(60.0, 80.0, 2.0);
        let chains = reflection_chains(&index, &s, &r, 2, 300.0);
        assert!(chains.iter().any(|c| c.facets.len() == 2));
        for c in &chains {
            for w in c.points.windows(2) {
                assert!(index.is_free_field(&w[0], &w[1]));
            }
        }
    }
}
