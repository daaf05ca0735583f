//! Test suites.

pub mod coherence_protocol;
pub mod lifecycle;
pub mod loader_image;
pub mod programs_mips;
pub mod programs_x86;
