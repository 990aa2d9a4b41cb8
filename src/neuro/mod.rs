//! The MRI pipelines and the tool wrappers they are built from.

pub mod myelin;
pub mod qsm;
mod scale;
mod sidecar;
pub mod tools;

pub use scale::{multi_maths_operands, parse_range, scale_to_pi};
pub use sidecar::{DEFAULT_ECHO_TIME, DEFAULT_FIELD_STRENGTH, read_sidecar};
