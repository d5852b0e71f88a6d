//! Sandbox containers: engine capability, lifecycle, pool, health, stats.

pub mod engine;
pub mod health;
pub mod lifecycle;
pub mod pool;
pub mod stats;

pub use engine::{ContainerEngine, DockerEngine, FakeEngine};
pub use lifecycle::{ContainerManager, ContainerState, Sandbox};
pub use pool::{ContainerPool, PoolHandle, PoolStatus};
