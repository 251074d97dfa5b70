pub mod config;
pub mod connection;
pub mod driver;
pub mod entity;
pub mod error;
pub mod peer;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod webrtc;
pub type Result<T> = std::result::Result<T, crate::error::SignalError>;
