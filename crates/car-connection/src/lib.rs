//! Car Service Connection Management
//!
//! Supervises the connection to the vehicle property service and shares a
//! single live connection between all consumers in the process.
//!
//! - [`ConnectionSupervisor`] acquires the handle through the platform's
//!   modern (async connect) or legacy (bind + reconnect) path.
//! - [`SharedConnection`] reference-counts one supervisor activation with a
//!   grace period before teardown.

mod config;
mod shared;
mod supervisor;

pub use config::{ConnectionConfig, ReconnectPolicy};
pub use shared::{ConnectionSubscriber, SharedConnection};
pub use supervisor::{ConnectionState, ConnectionStream, ConnectionSupervisor, SupervisorState};

/// Build a shared connection from a platform and configuration
pub fn connect_shared(
    platform: std::sync::Arc<dyn car_service::CarPlatform>,
    config: &ConnectionConfig,
) -> SharedConnection {
    let supervisor = ConnectionSupervisor::new(platform, config.reconnect.clone());
    SharedConnection::new(supervisor, config.grace_period())
}
