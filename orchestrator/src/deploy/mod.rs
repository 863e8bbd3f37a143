//! Deployment orchestration
//!
//! Adapters for the external engines (IaC tool, container toolchain, remote
//! command channel, cluster service, source control) and the two controllers
//! that drive records through their state machines.

pub mod application;
pub mod arena;
pub mod cluster;
pub mod container;
pub mod drift;
pub mod fsm;
pub mod infra;
pub mod locks;
pub mod manifest;
pub mod remote;
pub mod script;
pub mod source;
pub mod templates;
pub mod tfvars;
pub mod ticker;
pub mod validation;
pub mod workspace;
