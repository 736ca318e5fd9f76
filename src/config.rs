//! Runtime configuration for a debug session.
//!
//! All knobs have defaults that match production behavior; the `EUDEBUG_*`
//! environment variables exist for bring-up and triage.

use std::path::PathBuf;
use std::time::Duration;

/// Session configuration, fixed at attach time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target process ID.
    pub pid: u64,
    /// DRM render node carrying the debug interface.
    pub device_path: PathBuf,
    /// Allow attaching to individual tiles of a multi-tile device.
    pub tile_attach: bool,
    /// Transfer GPU memory through mmap instead of pread/pwrite.
    pub mmap_access: bool,
    /// How long to wait for an attention event after an interrupt.
    pub interrupt_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pid: 0,
            device_path: PathBuf::from("/dev/dri/renderD128"),
            tile_attach: true,
            mmap_access: false,
            interrupt_timeout: Duration::from_millis(2000),
        }
    }
}

impl Config {
    pub fn new(pid: u64) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }

    /// Applies `EUDEBUG_*` environment overrides on top of the defaults.
    pub fn from_env(pid: u64) -> Self {
        let mut config = Self::new(pid);

        if let Ok(v) = std::env::var("EUDEBUG_DEVICE") {
            config.device_path = PathBuf::from(&v);
            log::info!("device override: {}", v);
        }
        if let Some(v) = env_flag("EUDEBUG_TILE_ATTACH") {
            config.tile_attach = v;
            log::info!("tile attach override: {}", v);
        }
        if let Some(v) = env_flag("EUDEBUG_MMAP_ACCESS") {
            config.mmap_access = v;
            log::info!("mmap memory access override: {}", v);
        }
        if let Ok(v) = std::env::var("EUDEBUG_INTERRUPT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                config.interrupt_timeout = Duration::from_millis(ms);
                log::info!("interrupt timeout override: {} ms", ms);
            } else {
                log::warn!("ignoring unparsable EUDEBUG_INTERRUPT_TIMEOUT_MS = {:?}", v);
            }
        }
        config
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name) {
        Ok(v) => match v.as_str() {
            "1" | "true" | "on" => Some(true),
            "0" | "false" | "off" => Some(false),
            other => {
                log::warn!("ignoring unparsable {} = {:?}", name, other);
                None
            }
        },
        Err(_) => None,
    }
}
