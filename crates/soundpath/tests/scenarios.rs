//! Reference propagation scenarios.
//!
//! Geometry and expected values follow the flat and sloped benchmark cases
//! of the JRC-2012 reference report: a flat site with three absorption
//! bands, and a sloped site whose mean plane, equivalent heights and ground
//! coefficients are known.

use soundpath::geom::{Coord, Envelope};
use soundpath::path::{find_paths, PathConfig, PathKind};
use soundpath::profile::{cut_profile, CutPointKind};
use soundpath::scene::SceneBuilder;

fn flat_three_band_scene() -> SceneBuilder {
    let mut builder = SceneBuilder::new(Envelope::new(-20.0, -20.0, 250.0, 100.0));
    builder
        .add_ground_zone_rect(-20.0, 50.0, -20.0, 100.0, 0.2)
        .add_ground_zone_rect(50.0, 150.0, -20.0, 100.0, 0.5)
        .add_ground_zone_rect(150.0, 250.0, -20.0, 100.0, 0.9);
    builder
}

#[test]
fn flat_site_direct_path_reference_values() {
    let index = flat_three_band_scene().build().unwrap();
    let s = Coord::new(10.0, 10.0, 1.0);
    let r = Coord::new(200.0, 50.0, 4.0);
    let cfg = PathConfig {
        reflection_order: 0,
        g_s: 0.2,
        ..PathConfig::default()
    };

    let paths = find_paths(&index, &s, &r, &cfg);
    assert_eq!(paths.len(), 1, "flat site must yield exactly the direct path");
    let path = &paths[0];
    assert_eq!(path.kind, PathKind::Direct);
    assert_eq!(path.points.len(), 2);

    let seg = &path.segments[0];
    // Flat mean plane, physical heights survive.
    assert!(seg.a.abs() < 1e-6);
    assert!(seg.b.abs() < 0.01);
    assert!((seg.zs - 1.0).abs() < 0.01);
    assert!((seg.zr - 4.0).abs() < 0.01);
    assert!((seg.dp - 194.16).abs() < 0.1);
    // 3D straight distance.
    assert!((seg.d - (194.164f64.powi(2) + 9.0).sqrt()).abs() < 0.1);

    // Length-weighted absorption over the three bands.
    let expected = (0.2 * 40.88 + 0.5 * 102.19 + 0.9 * 51.09) / 194.16;
    assert!((seg.g_path - expected).abs() < 1e-3, "g_path = {}", seg.g_path);
}

#[test]
fn sloped_site_mean_plane_reference_values() {
    // Flat at 0 up to x = 120, linear climb to 10 m at x = 185, plateau
    // beyond. Receiver stands 4 m above the plateau.
    let mut builder = SceneBuilder::new(Envelope::new(-20.0, -20.0, 220.0, 100.0));
    builder
        .add_topo_line(Coord::new(-20.0, -20.0, 0.0), Coord::new(-20.0, 100.0, 0.0))
        .add_topo_line(Coord::new(120.0, -20.0, 0.0), Coord::new(120.0, 100.0, 0.0))
        .add_topo_line(Coord::new(185.0, -20.0, 10.0), Coord::new(185.0, 100.0, 10.0))
        .add_topo_line(Coord::new(220.0, -20.0, 10.0), Coord::new(220.0, 100.0, 10.0))
        .add_ground_zone_rect(-20.0, 50.0, -20.0, 100.0, 0.9)
        .add_ground_zone_rect(50.0, 150.0, -20.0, 100.0, 0.5)
        .add_ground_zone_rect(150.0, 220.0, -20.0, 100.0, 0.2);
    let index = builder.build().unwrap();

    let s = Coord::new(10.0, 10.0, 1.0);
    let r = Coord::new(200.0, 50.0, 14.0);
    let cfg = PathConfig {
        reflection_order: 0,
        g_s: 0.9,
        ..PathConfig::default()
    };

    let paths = find_paths(&index, &s, &r, &cfg);
    assert_eq!(paths.len(), 1);
    let seg = &paths[0].segments[0];

    assert!((seg.a - 0.055).abs() < 0.01, "a = {}", seg.a);
    assert!((seg.b - -2.83).abs() < 0.1, "b = {}", seg.b);
    assert!((seg.zs - 3.83).abs() < 0.1, "zs = {}", seg.zs);
    assert!((seg.zr - 6.16).abs() < 0.1, "zr = {}", seg.zr);
    assert!((seg.dp - 194.59).abs() < 1.5, "dp = {}", seg.dp);
    assert!((seg.g_path - 0.51).abs() < 0.02, "g_path = {}", seg.g_path);
    assert!(
        (seg.g_path_prime - 0.64).abs() < 0.02,
        "g_path_prime = {}",
        seg.g_path_prime
    );
    // Favorable heights sit above the homogeneous ones.
    assert!(seg.zs_f > seg.zs);
    assert!(seg.zr_f > seg.zr);
}

#[test]
fn sloped_site_mean_plane_from_topography_alone() {
    // The same terrain without any absorption zone: the mean plane must be
    // carried entirely by the topography cut points.
    let mut builder = SceneBuilder::new(Envelope::new(-20.0, -20.0, 220.0, 100.0));
    builder
        .add_topo_line(Coord::new(-20.0, -20.0, 0.0), Coord::new(-20.0, 100.0, 0.0))
        .add_topo_line(Coord::new(120.0, -20.0, 0.0), Coord::new(120.0, 100.0, 0.0))
        .add_topo_line(Coord::new(185.0, -20.0, 10.0), Coord::new(185.0, 100.0, 10.0))
        .add_topo_line(Coord::new(220.0, -20.0, 10.0), Coord::new(220.0, 100.0, 10.0));
    let index = builder.build().unwrap();

    let s = Coord::new(10.0, 10.0, 1.0);
    let r = Coord::new(200.0, 50.0, 14.0);
    let profile = cut_profile(&index, &s, &r);
    let topo = profile
        .points
        .iter()
        .filter(|p| p.kind == CutPointKind::Topography)
        .count();
    assert!(topo >= 2, "only {topo} topography cut points");

    let cfg = PathConfig {
        reflection_order: 0,
        ..PathConfig::default()
    };
    let paths = find_paths(&index, &s, &r, &cfg);
    assert_eq!(paths.len(), 1);
    let seg = &paths[0].segments[0];
    assert!((seg.a - 0.055).abs() < 0.01, "a = {}", seg.a);
    assert!((seg.b - -2.83).abs() < 0.1, "b = {}", seg.b);
    assert!((seg.zs - 3.83).abs() < 0.1, "zs = {}", seg.zs);
    assert!((seg.zr - 6.16).abs() < 0.1, "zr = {}", seg.zr);
}

#[test]
fn uniform_ground_keeps_coefficients_equal() {
    let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 300.0, 100.0));
    builder.add_ground_zone_rect(0.0, 300.0, 0.0, 100.0, 0.7);
    let index = builder.build().unwrap();
    let s = Coord::new(10.0, 50.0, 1.0);
    let r = Coord::new(290.0, 50.0, 4.0);
    let cfg = PathConfig {
        reflection_order: 0,
        g_s: 0.7,
        ..PathConfig::default()
    };
    let paths = find_paths(&index, &s, &r, &cfg);
    let seg = &paths[0].segments[0];
    assert!((seg.g_path - 0.7).abs() < 1e-9);
    // With g_s equal to g_path the primed blend collapses too.
    assert!((seg.g_path_prime - 0.7).abs() < 1e-9);
}

#[test]
fn blocked_site_produces_roof_and_corner_paths() {
    let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 120.0, 120.0));
    builder.add_building(
        vec![
            Coord::new(50.0, 40.0, 0.0),
            Coord::new(70.0, 40.0, 0.0),
            Coord::new(70.0, 80.0, 0.0),
            Coord::new(50.0, 80.0, 0.0),
        ],
        12.0,
        vec![0.1],
    );
    let index = builder.build().unwrap();
    let s = Coord::new(10.0, 60.0, 2.0);
    let r = Coord::new(110.0, 60.0, 3.0);
    let cfg = PathConfig {
        reflection_order: 0,
        ..PathConfig::default()
    };

    let paths = find_paths(&index, &s, &r, &cfg);
    assert!(paths.iter().all(|p| p.kind != PathKind::Direct));
    assert_eq!(
        paths
            .iter()
            .filter(|p| p.kind == PathKind::DiffractionH)
            .count(),
        1
    );
    assert_eq!(
        paths
            .iter()
            .filter(|p| p.kind == PathKind::DiffractionV)
            .count(),
        2
    );

    for path in paths.iter().filter(|p| p.kind == PathKind::DiffractionV) {
        // Corner paths stay near ground level and bend around the footprint.
        for p in &path.points[1..path.points.len() - 1] {
            assert_eq!(p.kind, CutPointKind::DiffractionV);
            assert!(p.coord.z < 4.0);
            assert!(index.building_at(&p.coord).is_none());
        }
        // Each leg is clear.
        for w in path.points.windows(2) {
            assert!(index.is_free_field(&w[0].coord, &w[1].coord));
        }
    }
}

#[test]
fn path_search_is_idempotent() {
    let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 120.0, 120.0));
    builder
        .add_building(
            vec![
                Coord::new(50.0, 40.0, 0.0),
                Coord::new(70.0, 40.0, 0.0),
                Coord::new(70.0, 80.0, 0.0),
                Coord::new(50.0, 80.0, 0.0),
            ],
            12.0,
            vec![],
        )
        .add_wall(
            Coord::new(20.0, 0.0, 0.0),
            Coord::new(20.0, 40.0, 0.0),
            6.0,
            vec![0.2],
        )
        .add_ground_zone_rect(0.0, 60.0, 0.0, 120.0, 0.6);
    let index = builder.build().unwrap();
    let s = Coord::new(10.0, 60.0, 2.0);
    let r = Coord::new(110.0, 60.0, 3.0);
    let cfg = PathConfig::default();

    let first = serde_json::to_string(&find_paths(&index, &s, &r, &cfg)).unwrap();
    let second = serde_json::to_string(&find_paths(&index, &s, &r, &cfg)).unwrap();
    assert_eq!(first, second);

    // Rebuilding the index from the same input changes nothing either.
    let rebuilt = builder.build().unwrap();
    let third = serde_json::to_string(&find_paths(&rebuilt, &s, &r, &cfg)).unwrap();
    assert_eq!(first, third);
}

#[test]
fn cut_profile_survives_serde_round_trip() {
    let index = flat_three_band_scene().build().unwrap();
    let s = Coord::new(10.0, 10.0, 1.0);
    let r = Coord::new(200.0, 50.0, 4.0);
    let profile = cut_profile(&index, &s, &r);

    let json = serde_json::to_string(&profile).unwrap();
    let back: soundpath::profile::CutProfile = serde_json::from_str(&json).unwrap();
    assert_eq!(back.points.len(), profile.points.len());
    assert!((back.g_path() - profile.g_path()).abs() < 1e-15);
    for (a, b) in back.points.iter().zip(profile.points.iter()) {
        assert_eq!(a.kind, b.kind);
        // Bit-exact coordinates back from JSON.
        assert_eq!(a.coord.x.to_bits(), b.coord.x.to_bits());
        assert_eq!(a.coord.y.to_bits(), b.coord.y.to_bits());
        assert_eq!(a.coord.z.to_bits(), b.coord.z.to_bits());
        assert_eq!(a.ground_z.to_bits(), b.ground_z.to_bits());
    }
}
