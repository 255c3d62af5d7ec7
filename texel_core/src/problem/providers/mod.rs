//! Built-in sample providers.

pub mod glyph;
pub mod xor;

pub use glyph::Glyphs;
pub use xor::XorLike;
