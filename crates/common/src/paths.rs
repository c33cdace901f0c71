use std::path::{Path, PathBuf};

const PID_FILE_NAME: &str = "telemuxd.pid";
const SQLITE_DB_NAME: &str = "telemetry.sqlite3";
const LOG_DIR_NAME: &str = "logs";
const CONFIG_FILE_NAME: &str = "config.toml";

pub fn pid_file(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(PID_FILE_NAME)
}

pub fn sqlite_db(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(SQLITE_DB_NAME)
}

pub fn log_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(LOG_DIR_NAME)
}

pub fn config_file(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(CONFIG_FILE_NAME)
}
