//! Range deployment: the range, network and VM state machines.

mod deploy;
mod events;
mod lifecycle;
mod network_ops;
mod orchestrator;
mod report;
mod strategy;
mod teardown;
mod vm_ops;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use events::*;
pub use orchestrator::*;
pub use report::*;
pub use strategy::*;
