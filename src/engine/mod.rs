pub mod background;
pub mod detector;
pub mod executor;
pub mod failover;
pub mod healing;
pub mod patterns;
pub mod provider;
pub mod quality;
pub mod schema_monitor;
pub mod selector;
pub mod subscription;
pub mod types;
pub mod validation;
