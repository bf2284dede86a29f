//! Distributed screen-space line integral convolution (LIC).
//!
//! Each rank renders surface geometry into screen-sized vector images over
//! a set of blocks. The blocks are redistributed with guard pixels, the
//! ping-pong LIC passes run on every rank, and the result is returned to the
//! geometry layout for coloring.

pub mod color;
pub mod comm;
pub mod decomp;
pub mod error;
pub mod extent;
pub mod image;
pub mod lic;
pub mod noise;
pub mod pipeline;
pub mod transfer;

pub use color::{ColorMode, ColorParams, combine_colors};
pub use comm::{Communicator, LocalComm, LocalWorld};
pub use decomp::{CompositeStrategy, DecompConfig, Decomposition, Strategy, decompose};
pub use error::{CommError, LicError, LicResult};
pub use extent::PixelExtent;
pub use image::Image;
pub use lic::{
    EnhanceContrast, IntegratorConfig, LicInputs, LicIntegrator, LicOutput, LicParams, VectorSpace,
};
pub use noise::{NoiseKind, NoiseParams, generate_noise};
pub use pipeline::{FrameInputs, FrameOutcome, FrameResult, SurfaceLic, Tiling};
pub use transfer::{TransferKind, TransferProgram, TransferStats};
