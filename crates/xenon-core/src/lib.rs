//! xenon-core — CPUKey value type and the devkit discovery wire protocol.
//! The scanner in xenon-scan builds on this crate.

pub mod cpukey;
pub mod wire;

pub use cpukey::{CpuKey, CpuKeyError};
