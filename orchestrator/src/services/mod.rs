//! Collaborators consumed by the orchestration core

pub mod credentials;
pub mod notify;
pub mod quota;
pub mod records;
