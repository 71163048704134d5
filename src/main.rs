use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// First argument, then `CADENCE_HOME`, then the current directory.
fn resolve_workspace_root() -> std::io::Result<PathBuf> {
    if let Some(arg) = std::env::args_os().nth(1) {
        return Ok(PathBuf::from(arg));
    }
    if let Some(home) = std::env::var_os("CADENCE_HOME") {
        return Ok(PathBuf::from(home));
    }
    std::env::current_dir()
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let workspace_root = match resolve_workspace_root() {
        Ok(path) => path,
        Err(error) => {
            tracing::error!(%error, "failed to resolve workspace root");
            return ExitCode::FAILURE;
        }
    };

    match cadence::run(&workspace_root).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "cadence stopped with an error");
            ExitCode::FAILURE
        }
    }
}
