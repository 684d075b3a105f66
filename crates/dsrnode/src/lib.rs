//! DSR node runtime
//!
//! Runs one routing engine per simulated node on a shared in-memory radio
//! medium and drives traffic through it.

pub mod config;
pub mod logging;
pub mod medium;
pub mod node;
pub mod scenario;

pub use config::Config;
pub use medium::{Frame, Medium};
pub use node::{Command, Node, NodeEvent, NodeHandle};
pub use scenario::ScenarioReport;
