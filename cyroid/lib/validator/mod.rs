//! Read-only pre-flight checks of a range before deployment.

mod deployment;
mod disk;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use deployment::*;
pub use disk::*;
