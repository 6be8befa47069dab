//! VyOS router containers and their configuration.
//!
//! Each range gets one router attached to the management network on `eth0` and to each range
//! network on `eth1`, `eth2`... Configuration is pushed as batched vbash scripts that commit and
//! save in a single exec.

mod controller;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use controller::*;
