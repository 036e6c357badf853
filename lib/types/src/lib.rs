//! Wire types shared by the shared-region host and both registries: the
//! fixed-capacity [`CpuMask`] bitset, the [`Pid`] newtype, and the stable
//! [`ErrorCode`] enum exchanged with callers at the library boundary.

mod error;
mod mask;
mod pid;

pub use error::{DlbResult, ErrorCode};
pub use mask::{CpuMask, MAX_CPUS};
pub use pid::Pid;
