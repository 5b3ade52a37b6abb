//! Database module: view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: insert payloads and view models used by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `ahorro_notify::db`; the repository
//! API and its view models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{NewNotificationLog, TriggerRunRow};
