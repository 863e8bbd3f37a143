//! Persisted record models

pub mod application;
pub mod credentials;
pub mod deployment;
