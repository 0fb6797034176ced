use anyhow::{anyhow, Result};
use std::fs;
use std::path::PathBuf;

pub struct AppPaths;

impl AppPaths {
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = match std::env::var("EXPLORER_CLI_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .ok_or_else(|| anyhow!("Cannot determine data directory"))?
                .join("explorer-cli"),
        };

        fs::create_dir_all(&data_dir)?;
        Ok(data_dir)
    }

    pub fn log_dir() -> Result<PathBuf> {
        let log_dir = Self::data_dir()?.join("logs");
        fs::create_dir_all(&log_dir)?;
        Ok(log_dir)
    }

    pub fn history_file() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("history.txt"))
    }

    /// Where the schema panel's open/closed flag lives between sessions
    pub fn panel_state_file() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("panel_state.json"))
    }

    /// Destination for client-side exports, falling back to the data dir
    pub fn download_dir() -> Result<PathBuf> {
        match dirs::download_dir() {
            Some(dir) => Ok(dir),
            None => Self::data_dir(),
        }
    }
}
