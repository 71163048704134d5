use crate::infrastructure::config::{AppConfig, ensure_default_configs, load_app_config};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};

const DATABASE_FILE: &str = "cadence.sqlite";

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub database_path: PathBuf,
    pub config: AppConfig,
}

/// Lays out `config/` and `state/` under the workspace root, writes default
/// config on first run and brings the database schema up.
pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let database_path = state_dir.join(DATABASE_FILE);

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;

    ensure_default_configs(&config_dir)?;
    let config = load_app_config(&config_dir)?;
    initialize_database(&database_path)?;
    tracing::info!(
        workspace = %workspace_root.display(),
        database = %database_path.display(),
        "workspace ready"
    );

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        database_path,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bootstrap_creates_layout_and_is_repeatable() {
        let dir = TempDir::new().expect("temp dir");

        let first = bootstrap_workspace(dir.path()).expect("first bootstrap");
        assert!(first.config_dir.join("app.json").is_file());
        assert!(first.database_path.is_file());
        assert_eq!(first.config, AppConfig::default());

        let second = bootstrap_workspace(dir.path()).expect("second bootstrap");
        assert_eq!(second.database_path, first.database_path);
    }

    #[test]
    fn edited_config_is_picked_up() {
        let dir = TempDir::new().expect("temp dir");
        bootstrap_workspace(dir.path()).expect("first bootstrap");
        fs::write(
            dir.path().join("config").join("app.json"),
            r#"{"schema": 1, "calendar_name": "Routines"}"#,
        )
        .expect("edit config");

        let result = bootstrap_workspace(dir.path()).expect("second bootstrap");
        assert_eq!(result.config.calendar_name, "Routines");
    }
}
