//! `cyroid` orchestrates isolated cyber ranges on a single Docker host.
//!
//! # Overview
//!
//! Each range gets its own Docker-in-Docker sandbox so many ranges can reuse identical address
//! space side by side. Inside the sandbox cyroid provisions:
//! - bridge networks with iptables isolation
//! - a VyOS router for routing, NAT, DHCP and firewalling
//! - VM and container workloads with forwarded console ports
//!
//! Deployment is forward-only and tolerant of partial failure: a failing VM is marked `ERROR`
//! and the rest of the range still comes up. Every step is recorded in a
//! [`DeploymentReport`](orchestration::DeploymentReport) and streamed as events.
//!
//! # Architecture
//!
//! - **Docker**: a narrow async facade over the Engine API
//! - **DinD**: sandbox containers, their data volumes and cached nested-daemon clients
//! - **Isolation**: default-deny forwarding and console DNAT inside a sandbox
//! - **VyOS**: router containers driven through batched vbash scripts
//! - **Orchestration**: the range, network and VM state machines
//! - **Validator**: read-only pre-flight checks
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cyroid::{
//!     config::Settings,
//!     docker::{BollardConnector, BollardDocker},
//!     orchestration::{Orchestrator, TracingEventSink},
//!     store::MemoryStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::new(
//!         Settings::from_env()?,
//!         Arc::new(BollardDocker::connect_local()?),
//!         Arc::new(BollardConnector::default()),
//!         Arc::new(MemoryStore::default()),
//!         Arc::new(TracingEventSink),
//!     );
//!
//!     let report = orchestrator.deploy_range(uuid::Uuid::nil()).await?;
//!     println!("{report}");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`command`] - Validated iptables and VyOS command builders
//! - [`config`] - Settings and defaults
//! - [`dind`] - Sandbox lifecycle and client registry
//! - [`docker`] - Docker Engine facade
//! - [`isolation`] - Sandbox iptables rules
//! - [`orchestration`] - Range deployment
//! - [`proxy`] - Console proxying
//! - [`store`] - Persistence
//! - [`validator`] - Pre-flight checks
//! - [`vyos`] - Router control

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod command;
pub mod config;
pub mod dind;
pub mod docker;
pub mod isolation;
pub mod models;
pub mod orchestration;
pub mod proxy;
pub mod store;
pub mod utils;
pub mod validator;
pub mod vyos;

#[cfg(test)]
pub(crate) mod testing;

pub use error::*;
