//! Core engine of the sandbox lifecycle manager.
//!
//! Warm pools of pre-created sandboxes are kept at a utilization-targeted
//! size by one reconciling controller per template. Claims take a pending
//! record out of its pool through the store's optimistic locking, the route
//! registry mirrors claimed sandboxes into the request router (and into
//! peer processes), and per-sandbox expiration timers persist as conditions
//! on the records so they survive restarts. The manager facade ties these
//! together behind claim/get/list/pause/resume/kill operations.

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod pool;
pub mod routes;
pub mod sandbox;
pub mod template;
pub mod timer;

pub use config::ManagerConfig;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, EventHandler, EventType, SandboxEvent};
pub use manager::SandboxManager;
pub use pool::{group_sandboxes, ClaimOptions, Pool, PoolStatusSnapshot, SandboxGroups};
pub use routes::{Route, RouteRegistry};
pub use sandbox::{CsiMountRequest, Sandbox};
pub use template::{load_templates, PoolTemplate, TemplateDefaults};
pub use timer::{TimerHub, TIMER_CONDITION_PREFIX};
