//! Assembly of completed tiles into a canvas or an output container.

pub mod canvas;
pub mod writer;

pub use canvas::Canvas;
pub use writer::TiledWriter;
