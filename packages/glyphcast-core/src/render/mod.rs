//! ASCII rendering collaborators: palettes, image→glyph conversion, and
//! participant grid composition.
//!
//! Everything here is a pure function of its inputs; the render workers own
//! all state (palette caches live in the client records).

pub mod ascii;
pub mod grid;
pub mod palette;

pub use ascii::{image_to_cell, placeholder_cell, ConvertOptions};
pub use grid::{cell_dimensions, compose_grid, grid_dimensions};
pub use palette::Palette;
