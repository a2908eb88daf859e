pub mod config;
pub mod heartbeat_monitor;
