pub mod connection;
pub mod event_bridge;
pub mod hub;
pub mod requests;
pub mod server;
pub mod status;

pub use hub::{Hub, HubConfig};
pub use server::{start, ServerConfig, ServerHandle};
pub use status::StatusService;
