mod cli;
mod file;
mod store;

pub use cli::Cli;
pub use cli::Commands;
pub use cli::StartArgs;
pub use file::ConfigError;
pub use file::MetaGpuConfig;
pub use file::VisibilityConfig;
pub use store::ConfigStore;
pub use store::ConfigWatcher;
