//! High-availability control plane: leader election, health monitoring,
//! failover orchestration.

pub mod failover;
pub mod leader;
pub mod monitor;

pub use failover::{FailoverCoordinator, FailoverStore};
pub use leader::LeaderElector;
pub use monitor::{HealthMonitor, HealthState};
