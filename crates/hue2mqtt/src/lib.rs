pub mod command;
pub mod config;
pub mod debounce;
pub mod hue;
pub mod mqtt;
pub mod runner;
pub mod thing;

pub use command::HueCommand;
pub use config::AppConfig;
pub use config::ConfigError;
pub use runner::Runner;
pub use thing::Thing;
pub use thing::ThingRegistry;
