mod manager;

pub use manager::{Config, ConfigManager, DEFAULT_FTP_PORT, ServerProfile, Settings};
