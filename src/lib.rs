pub mod cni;
pub mod error;
pub mod libcni;
pub mod namespace;
pub mod types;

pub use cni::{CNIClient, Client, PluginStep};
pub use error::{Error, Result};
pub use types::Config;
