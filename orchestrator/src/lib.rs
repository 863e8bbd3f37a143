//! stackpilot library
//!
//! Deployment orchestration core: IaC workspaces, container image pipelines,
//! remote and cluster deploy targets, and drift reconciliation.

pub mod app;
pub mod cloud;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod process;
pub mod server;
pub mod services;
pub mod storage;
pub mod utils;
pub mod workers;
