//! Operations built on the tiling engine: import, export, pyramid and slicing.

pub mod exporter;
pub mod importer;
pub mod pyramid;
pub mod slicer;

pub use exporter::{ExportReport, TileExporter};
pub use importer::{ImportPlan, ImportRequest, ImportedImage, LargeImageImporter, Resolution};
pub use pyramid::{LevelReport, PyramidDriver, PyramidState, WriterFactory};
pub use slicer::{SliceOptions, SliceReport, TileSlicer};
