//! Hardware constants for the EXI bus and the serial memory cards attached to it.
//!
//! Nothing in this crate performs I/O; it only names the numbers that the
//! driver and the emulated device have to agree on.

pub mod exi;
pub mod memcard;
