pub mod audit;
pub mod containers;
pub mod coord;
pub mod deps;
pub mod ha;
pub mod jobs;
pub mod metrics;
pub mod runners;
pub mod secrets;
pub mod security;
pub mod stream_hub;
pub mod webhooks;

pub use deps::OrchestratorDeps;
pub use stream_hub::StreamHub;
