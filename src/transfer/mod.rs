//! Point-to-point block transfers between the geometry decomposition and
//! the LIC decomposition.

mod exec;
mod program;

pub use exec::TransferStats;
pub use program::{Transaction, TransferKind, TransferProgram};
