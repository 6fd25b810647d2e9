//! Program generators, one module per operation family.

pub mod concat;
pub mod conv;
pub mod elementwise;
pub mod matmul;
pub mod permute;
pub mod preamble;
pub mod reduction;

pub use concat::ConcatProgram;
pub use conv::{Conv2dProgram, Conv2dTransposeProgram};
pub use elementwise::{BinaryProgram, UnaryProgram, UnaryScalars};
pub use matmul::MatMulProgram;
pub use permute::PermuteProgram;
pub use reduction::ReduceProgram;
