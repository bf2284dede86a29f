//! Ping-pong LIC integrator: buffers, pass kernels and the pass sequence.

mod buffers;
mod integrator;
mod params;
pub mod passes;

pub use buffers::{CLEAR_HALO, LIC_CLEAR, PingPongBuffers, ReadSet, ResourceRole, WriteSet};
pub(crate) use integrator::global_min_max;
pub use integrator::{IntegratorConfig, LicInputs, LicIntegrator, LicOutput};
pub(crate) use params::check_contrast_factors;
pub use params::{EnhanceContrast, LicParams, VectorSpace};
