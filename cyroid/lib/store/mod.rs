//! Persistence of ranges, their networks, VMs and routers, plus read access to the image catalog.

mod memory;
mod range_store;
mod sqlite;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use memory::*;
pub use range_store::*;
pub use sqlite::*;
