//! Path assembly: turns raw geometry (profiles, hull chains, reflection
//! chains) into propagation paths with their ground segments.
//!
//! Segment parameters follow the JRC-2012 reference report: equivalent
//! source and receiver heights above the mean ground plane, their favorable
//! condition variants, and the length-weighted ground absorption with its
//! primed form for short paths.

use serde::{Deserialize, Serialize};

use crate::geom::{mean_plane, unfold, Coord, Point2, EPSILON};
use crate::index::SceneIndex;
use crate::profile::{cut_profile, CutPointKind};
use crate::reflection::{reflection_chains_with, MirrorReceiverIndex};
use crate::{diffraction, geom};

/// Meteorological ray-curvature coefficient of the favorable-condition
/// height corrections.
const ALPHA0: f64 = 2e-4;

/// What a propagation path is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathKind {
    Direct,
    /// Over one or more horizontal (roof) edges.
    DiffractionH,
    /// Around one or more vertical (corner) edges.
    DiffractionV,
    /// One or more specular wall reflections.
    Reflection,
}

/// One vertex of a propagation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathPoint {
    pub coord: Coord,
    pub kind: CutPointKind,
    /// Facade absorption at a reflection point, empty elsewhere.
    pub alpha: Vec<f64>,
}

/// Ground segment parameters of one leg (or of the whole path).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SegmentPath {
    /// Mean ground plane `z = a*x + b` in the unfolded plane.
    pub a: f64,
    pub b: f64,
    /// Equivalent source/receiver heights above the mean plane.
    pub zs: f64,
    pub zr: f64,
    /// Favorable-condition equivalents, curvature corrected.
    pub zs_f: f64,
    pub zr_f: f64,
    /// Distance between the mean-plane projections of the endpoints.
    pub dp: f64,
    /// Straight endpoint distance in the unfolded plane.
    pub d: f64,
    pub g_path: f64,
    /// Primed ground absorption. `NaN` on every sub-segment where the
    /// primed form is undefined (all but the source-side leg of a split
    /// path). Encoded as `null` in JSON.
    #[serde(serialize_with = "nan_as_null", deserialize_with = "null_as_nan")]
    pub g_path_prime: f64,
}

fn nan_as_null<S: serde::Serializer>(v: &f64, s: S) -> std::result::Result<S::Ok, S::Error> {
    if v.is_nan() {
        s.serialize_none()
    } else {
        s.serialize_some(v)
    }
}

fn null_as_nan<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
}

/// A complete propagation path from one source to one receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationPath {
    pub kind: PathKind,
    pub points: Vec<PathPoint>,
    /// One ground segment per leg between consecutive path points.
    pub segments: Vec<SegmentPath>,
    /// Ground segment of the straight source-receiver line.
    pub sr: SegmentPath,
}

impl PropagationPath {
    /// Total 3D length along the path points.
    pub fn length(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| w[0].coord.distance_3d(&w[1].coord))
            .sum()
    }

    /// Path length under favorable propagation conditions, each leg bent
    /// along the curved ray of radius `max(1000, 8*d)`.
    pub fn favorable_length(&self) -> f64 {
        let d = self.sr.d;
        self.points
            .windows(2)
            .map(|w| geom::to_curve(w[0].coord.distance_3d(&w[1].coord), d))
            .sum()
    }
}

/// Search configuration for one source-receiver pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Maximum number of successive wall reflections. Zero disables the
    /// reflection search entirely.
    pub reflection_order: usize,
    /// Walls farther than this from the receiver are not mirrored.
    pub max_reflection_dist: f64,
    pub diffract_horizontal: bool,
    pub diffract_vertical: bool,
    /// Ground absorption at the source, used by the primed coefficient.
    pub g_s: f64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            reflection_order: 1,
            max_reflection_dist: 50.0,
            diffract_horizontal: true,
            diffract_vertical: true,
            g_s: 0.0,
        }
    }
}

/// Ground segment between two unfolded endpoints over an unfolded terrain
/// profile.
pub fn compute_segment(
    src: Point2,
    rcv: Point2,
    mean: (f64, f64),
    g_path: f64,
    g_s: f64,
    compute_prime: bool,
) -> SegmentPath {
    let (a, b) = mean;
    let sp = geom::project_on_mean_plane(&src, a, b);
    let rp = geom::project_on_mean_plane(&rcv, a, b);
    let zs = src.distance(&sp);
    let zr = rcv.distance(&rp);
    let dp = sp.distance(&rp);
    let d = src.distance(&rcv);

    let g_path_prime = if compute_prime {
        let denom = 30.0 * (zs + zr);
        if denom > EPSILON {
            let test_form = dp / denom;
            if test_form <= 1.0 {
                g_path * test_form + g_s * (1.0 - test_form)
            } else {
                g_path
            }
        } else {
            g_path
        }
    } else {
        f64::NAN
    };

    let sum = zs + zr;
    let (zs_f, zr_f) = if sum > EPSILON {
        let delta_zt = 6e-3 * dp / sum;
        let delta_zs = ALPHA0 * (zs / sum).powi(2) * dp * dp / 2.0;
        let delta_zr = ALPHA0 * (zr / sum).powi(2) * dp * dp / 2.0;
        (zs + delta_zs + delta_zt, zr + delta_zr + delta_zt)
    } else {
        (zs, zr)
    };

    SegmentPath {
        a,
        b,
        zs,
        zr,
        zs_f,
        zr_f,
        dp,
        d,
        g_path,
        g_path_prime,
    }
}

/// Ground segment of the leg `[pa, pb]`, tracing its own cut profile.
fn leg_segment(
    index: &SceneIndex,
    pa: &Coord,
    pb: &Coord,
    g_s: f64,
    compute_prime: bool,
) -> SegmentPath {
    let profile = cut_profile(index, pa, pb);
    let ground = unfold(&profile.ground_points());
    let mean = mean_plane(&ground);
    let src = Point2::new(0.0, pa.z);
    let rcv = Point2::new(ground.last().map(|p| p.x).unwrap_or(0.0), pb.z);
    compute_segment(src, rcv, mean, profile.g_path(), g_s, compute_prime)
}

/// Path from an explicit point chain: one ground segment per leg, primed
/// absorption only on the source-side leg.
fn chain_path(
    index: &SceneIndex,
    kind: PathKind,
    chain: &[Coord],
    interior_kind: CutPointKind,
    cfg: &PathConfig,
) -> PropagationPath {
    let n = chain.len();
    let mut points = Vec::with_capacity(n);
    for (i, c) in chain.iter().enumerate() {
        let point_kind = if i == 0 {
            CutPointKind::Source
        } else if i == n - 1 {
            CutPointKind::Receiver
        } else {
            interior_kind
        };
        points.push(PathPoint {
            coord: *c,
            kind: point_kind,
            alpha: Vec::new(),
        });
    }
    let single = n == 2;
    let segments: Vec<SegmentPath> = chain
        .windows(2)
        .enumerate()
        .map(|(i, w)| leg_segment(index, &w[0], &w[1], cfg.g_s, single || i == 0))
        .collect();
    let sr = leg_segment(index, &chain[0], &chain[n - 1], cfg.g_s, true);
    PropagationPath {
        kind,
        points,
        segments,
        sr,
    }
}

/// Every propagation path between `source` and `receiver` under `cfg`:
/// the direct path when the line of sight is clear, diffracted paths over
/// roofs and around corners when it is not, and reflected paths up to the
/// configured order.
pub fn find_paths(
    index: &SceneIndex,
    source: &Coord,
    receiver: &Coord,
    cfg: &PathConfig,
) -> Vec<PropagationPath> {
    let mirrors = MirrorReceiverIndex::build(
        index,
        receiver,
        cfg.reflection_order,
        cfg.max_reflection_dist,
    );
    find_paths_with(index, source, receiver, cfg, &mirrors)
}

/// Same as [`find_paths`] with a prebuilt mirror-receiver index, so the
/// scheduler mirrors each receiver once and probes every source against it.
pub fn find_paths_with(
    index: &SceneIndex,
    source: &Coord,
    receiver: &Coord,
    cfg: &PathConfig,
    mirrors: &MirrorReceiverIndex,
) -> Vec<PropagationPath> {
    let mut out = Vec::new();
    let profile = cut_profile(index, source, receiver);

    if !profile.blocked {
        out.push(chain_path(
            index,
            PathKind::Direct,
            &[*source, *receiver],
            CutPointKind::Source,
            cfg,
        ));
    } else {
        if cfg.diffract_horizontal {
            if let Some(chain) = diffraction::over_roof_chain(&profile) {
                out.push(chain_path(
                    index,
                    PathKind::DiffractionH,
                    &chain,
                    CutPointKind::DiffractionH,
                    cfg,
                ));
            }
        }
        if cfg.diffract_vertical {
            for chain in diffraction::vertical_edge_chains(index, source, receiver) {
                out.push(chain_path(
                    index,
                    PathKind::DiffractionV,
                    &chain,
                    CutPointKind::DiffractionV,
                    cfg,
                ));
            }
        }
    }

    if cfg.reflection_order > 0 {
        for refl in reflection_chains_with(index, source, mirrors) {
            let mut path = chain_path(
                index,
                PathKind::Reflection,
                &refl.points,
                CutPointKind::Source,
                cfg,
            );
            for (i, &facet) in refl.facets.iter().enumerate() {
                let f = index.facet(facet);
                let p = &mut path.points[i + 1];
                p.kind = CutPointKind::Reflection {
                    obstacle: f.kind,
                    origin: f.origin,
                };
                p.alpha = f.alpha.clone();
            }
            out.push(path);
        }
    }

    out
}
