//! I/O layer - server process and its output
//!
//! - **Process**: game server lifecycle, owned by `ProcessSupervisor`
//! - **Output**: stdout capture into the single-producer/single-consumer output queue
//!
//! Nothing here knows about chat channels or RCON framing.

pub mod output;
pub mod process;

pub use output::{OutputReader, output_queue};
pub use process::ProcessSupervisor;
