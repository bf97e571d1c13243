//! Audio front end for the spectral losses.
//!
//! - Window functions selectable by name
//! - Differentiable magnitude STFT over windowed DFT bases
//! - Reflect/replicate time-axis padding

mod stft;
mod window;

pub use stft::*;
pub use window::WindowKind;
