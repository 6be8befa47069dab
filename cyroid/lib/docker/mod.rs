//! A narrow Docker Engine facade used against the host daemon and the nested daemons inside
//! range sandboxes.

mod api;
mod engine;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use api::*;
pub use engine::*;
