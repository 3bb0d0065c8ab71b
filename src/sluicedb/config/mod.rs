mod config;
mod service;
mod enums;
mod load;

pub use config::*;
pub use service::*;
pub use enums::*;
pub use load::{load_config, parse_config};
