//! Typed builders for the commands executed inside sandboxes and routers.
//!
//! Every value interpolated into an iptables argv or a VyOS script passes through a validated
//! type from [`validate`] first; nothing else in the crate formats these commands.

mod iptables;
mod validate;
mod vyos;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use iptables::*;
pub use validate::*;
pub use vyos::*;
