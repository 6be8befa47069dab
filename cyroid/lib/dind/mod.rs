//! Docker-in-Docker sandboxes, one per range.

mod manager;
mod registry;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use manager::*;
pub use registry::*;
