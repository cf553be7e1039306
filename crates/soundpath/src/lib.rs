#![doc = include_str!("../README.md")]

pub mod diffraction;
pub mod error;
pub mod geom;
pub mod grid;
pub mod index;
pub mod mesh;
pub mod path;
pub mod profile;
pub mod reflection;
pub mod scene;

pub use error::{Result, SoundPathError};
pub use geom::{Coord, Envelope, Point2};
pub use grid::{
    CancelToken, GeoJsonSink, GridConfig, JsonLinesSink, MemorySink, PathSink, Receiver, RunStats,
    Source,
};
pub use index::SceneIndex;
pub use path::{find_paths, PathConfig, PathKind, PropagationPath, SegmentPath};
pub use profile::{cut_profile, CutPoint, CutPointKind, CutProfile};
pub use scene::SceneBuilder;
