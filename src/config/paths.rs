//! Platform-specific data directory paths.
//!
//!   Windows: %APPDATA%/speech-core
//!   macOS:   ~/Library/Application Support/speech-core
//!   Linux:   $XDG_CONFIG_HOME/speech-core (default ~/.config/speech-core)
//!
//! `SPEECH_CORE_DIR` overrides the resolved directory entirely, which is
//! also what the tests use to point the pipeline at a temp directory.

use std::path::PathBuf;

/// Get the speech-core data directory (cross-platform).
pub fn get_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("SPEECH_CORE_DIR") {
        return PathBuf::from(dir);
    }
    get_config_base().join("speech-core")
}

/// Get the platform-appropriate base config directory.
fn get_config_base() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        // %APPDATA% (typically C:\Users\<user>\AppData\Roaming)
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata);
        }
        dirs::config_dir().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("AppData")
                .join("Roaming")
        })
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Application Support")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // Linux and other Unix: respect XDG_CONFIG_HOME, default ~/.config
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    }
}
