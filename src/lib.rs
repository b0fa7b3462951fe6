pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod installer;
pub mod logging;
pub mod remote;
pub mod server;

pub use error::{Error, Result};
