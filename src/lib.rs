//! Core orchestration engine for catalog-driven infrastructure reconciliation.
//!
//! The controller owns a set of tasks, routes template-change notifications
//! from the catalog watcher to dynamic tasks, drives cron-scheduled tasks on
//! their own loops, enforces at-most-one in-flight execution per task, and
//! records every render+apply attempt in a bounded in-memory event history.

pub mod config;
pub mod driver;
pub mod engine;
pub mod models;
pub mod retry;
pub mod services;
pub mod storage;
pub mod watcher;

pub use config::{CatalogConfig, Config, TaskConfig};
pub use driver::{Driver, DriverFactory, Drivers};
pub use engine::controller::Controller;
pub use engine::EngineError;
pub use models::{Condition, Event, EventError, Task};
pub use retry::Retry;
pub use storage::{EventStore, StateStore};
pub use watcher::Watcher;
