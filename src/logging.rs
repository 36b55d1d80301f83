use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "FLEETMON_LOG";
pub const LOG_FILE_NAME: &str = "fleetmon.log";

/// Routes diagnostics to `<log_dir>/fleetmon.log`. The live screen owns the
/// terminal, so nothing is ever written to stdout or stderr.
///
/// A subscriber installed earlier in the process stays in place.
pub fn init_file_logging(log_dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(log_dir)?;
    let path = log_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(path = %path.display(), "diagnostic log opened");
    }
    Ok(path)
}
