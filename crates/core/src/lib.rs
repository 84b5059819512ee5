//! `vaultline-core` — identifiers and the domain error model shared by every
//! other crate in the workspace.
//!
//! This crate has no infrastructure concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{AuditId, EngineGuid, PlanId, TaskId};
