//! Configuration file location

use std::path::PathBuf;

/// Project name used for platform directories
const PROJECT_NAME: &str = "webprobe";

/// Environment variable overriding the configuration file path
pub const CONFIG_ENV: &str = "WEBPROBE_CONFIG";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/webprobe/`
/// - macOS: `~/Library/Application Support/webprobe/`
/// - Windows: `%APPDATA%\webprobe\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", PROJECT_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
///
/// `WEBPROBE_CONFIG` wins over the platform location.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|path| !path.is_empty()) {
        return Some(PathBuf::from(path));
    }
    config_dir().map(|dir| dir.join("config.toml"))
}
