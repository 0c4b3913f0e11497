//! Linear forward operators and regularizers of the inverse problem.

pub mod convolution;
pub mod penalty;

pub use convolution::{ConvolutionOperator, PaddingGeometry};
pub use penalty::{Penalty, PenaltyKind};
