pub mod audit_log;
pub mod catalog;
pub mod client;
pub mod config;
pub mod demo;
pub mod effects;
pub mod logger;
pub mod permission_file;
pub mod schema;
pub mod server;
pub mod transport;

pub use sidechannel_protocol as protocol;
