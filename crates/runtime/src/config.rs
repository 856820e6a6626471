//! Process-Wide Configuration
//!
//! Three settings the command-line front end decides and the core
//! consumes: the boot-image path, the kernel-library path, and the
//! verbosity level. They are written once at startup; later writes are
//! rejected rather than raced over.

use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

/// Startup settings, written once by the front end.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Path of the boot image the external loader consumes.
    pub boot_image: Option<PathBuf>,
    /// Path of the kernel library loaded at boot.
    pub kernel_library: Option<PathBuf>,
    /// 0 = silent; higher values turn on info, debug, then trace logging.
    pub verbosity: u8,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Install the startup configuration. Returns false (and changes nothing)
/// if it was already set.
pub fn configure(config: Config) -> bool {
    CONFIG.set(config).is_ok()
}

/// The active configuration; defaults when the front end never configured.
pub fn config() -> &'static Config {
    static DEFAULT: Config = Config {
        boot_image: None,
        kernel_library: None,
        verbosity: 0,
    };
    CONFIG.get().unwrap_or(&DEFAULT)
}

/// Map the verbosity level onto a tracing filter directive.
pub fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "off",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install a `tracing` subscriber honoring the configured verbosity (or
/// `RUST_LOG` when set). Safe to call more than once; only the first
/// installation wins.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_filter(config().verbosity)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
