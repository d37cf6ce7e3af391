//! Role identities, registry and engines.

mod engine;
mod registry;

pub use engine::{RoleEngine, describe_tool};
pub use registry::{RoleConfig, RoleRegistry};
