pub mod config;

pub use config::{Peer, ServerConfig};
