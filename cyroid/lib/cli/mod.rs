//! Command-line interface: arguments, terminal styles and range definition files.

mod args;
mod definition;
mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
pub use definition::*;
pub use styles::*;
