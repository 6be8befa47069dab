//! Forwarding rules inside range sandboxes.
//!
//! Every rule runs as a privileged `iptables` exec in the sandbox container on the host daemon.
//! Docker network names are resolved through the nested daemon to their Linux bridges.

mod engine;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use engine::*;
