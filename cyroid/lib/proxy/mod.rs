//! Console proxying from the sandbox management address to VM consoles.

mod nginx;
mod vnc;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use nginx::*;
pub use vnc::*;
