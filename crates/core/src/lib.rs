pub mod config;
pub mod target;
pub mod value;

pub use config::EngineSettings;
pub use target::*;
pub use value::*;
