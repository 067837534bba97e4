pub mod args;
pub mod bus;
pub mod command;
pub mod emu;
pub mod error;
pub mod geometry;
pub mod memcard;
pub mod probe;
pub mod sync;

// Re-export commonly used types
pub use args::Args;
pub use bus::{Channel, ClockSpeed, Device, ExiBus};
pub use command::{CardAddress, Command};
pub use emu::{EmulatedBus, EmulatedCard};
pub use error::{Error, Result};
pub use geometry::CardGeometry;
pub use memcard::{CardSession, CardStatus};
pub use probe::{ChannelOutcome, Probe, ProbeConfig, ProbeReport};
