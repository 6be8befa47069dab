//! Utility functions and types.

mod env;
mod naming;
mod net;
mod path;
mod text;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use env::*;
pub use naming::*;
pub use net::*;
pub use path::*;
pub use text::*;
