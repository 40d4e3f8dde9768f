/// Configuration module. This module is used to parse configuration from command line arguments
/// and the `DAT_*` environment
mod config;
/// Inner configuration module. This module is used to store the parsed configuration
/// and will be used to initialize the driver
mod inner;

pub use config::Config;
pub use inner::{BackendConfig, HostConfig, InnerConfig, ServiceType};
