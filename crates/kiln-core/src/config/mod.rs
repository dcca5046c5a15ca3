mod dirs;
mod settings;
mod validation;

pub use dirs::Directories;
pub use settings::{Config, DebugSettings, DiscoverySettings, INTERPRETERS, OperationSettings};
pub use validation::warn_unknown_fields;
