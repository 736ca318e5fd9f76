//! Attach bookkeeping across sessions.
//!
//! A debuggee accepts exactly one debugger. Racing a second open against
//! the kernel wastes a channel bring-up and surfaces as EBUSY late, so
//! the registry reserves the pid up front and refuses duplicates locally.
//! Sessions release their reservation on shutdown.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::Config;
use crate::error::{DebugError, Result};
use crate::fd::DebugFd;
use crate::session::DebugSession;
use crate::topology::DeviceInfo;

/// Pid reservations shared by every session attached through it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    attached: Mutex<HashSet<u64>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches to `config.pid` through the configured DRM render node,
    /// holding the pid reserved for the lifetime of the session.
    #[cfg(target_os = "linux")]
    pub fn attach(self: &Arc<Self>, config: Config, device: DeviceInfo) -> Result<DebugSession> {
        self.reserve(config.pid)?;
        let fd = match crate::fd::open_debug_fd(&config.device_path, config.pid) {
            Ok(fd) => Arc::new(fd) as Arc<dyn DebugFd>,
            Err(err) => {
                let errno = err.raw_os_error().unwrap_or(0);
                log::error!("debugger open for pid {} failed: {}", config.pid, err);
                self.release(config.pid);
                return Err(DebugError::from_open_errno(errno));
            }
        };
        DebugSession::attach_internal(config, device, fd, Some(Arc::clone(self)))
    }

    /// Attaches over an already open channel. Failed attaches release the
    /// reservation before returning.
    pub fn attach_with_fd(
        self: &Arc<Self>,
        config: Config,
        device: DeviceInfo,
        fd: Arc<dyn DebugFd>,
    ) -> Result<DebugSession> {
        self.reserve(config.pid)?;
        DebugSession::attach_internal(config, device, fd, Some(Arc::clone(self)))
    }

    fn reserve(&self, pid: u64) -> Result<()> {
        let mut attached = self.lock();
        if !attached.insert(pid) {
            return Err(DebugError::NotAvailable(format!(
                "a debugger is already attached to pid {}",
                pid
            )));
        }
        log::debug!("pid {} reserved", pid);
        Ok(())
    }

    /// Frees a pid reservation. Idempotent.
    pub fn release(&self, pid: u64) {
        if self.lock().remove(&pid) {
            log::debug!("pid {} released", pid);
        }
    }

    pub fn is_attached(&self, pid: u64) -> bool {
        self.lock().contains(&pid)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u64>> {
        match self.attached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::MockDebugFd;
    use crate::topology::DeviceTopology;

    #[test]
    fn second_reservation_is_refused() {
        let registry = SessionRegistry::new();
        registry.reserve(42).unwrap();
        assert!(matches!(
            registry.reserve(42),
            Err(DebugError::NotAvailable(_))
        ));
        assert!(registry.is_attached(42));

        registry.release(42);
        registry.release(42);
        assert!(!registry.is_attached(42));
        registry.reserve(42).unwrap();
    }

    #[test]
    fn failed_attach_releases_the_reservation() {
        let registry = SessionRegistry::new();
        let fd = Arc::new(MockDebugFd::new());
        let device = DeviceInfo::new(DeviceTopology::uniform(1, 2, 4, 8, 7));

        // No replay events pending, so the attach is refused.
        let result = registry.attach_with_fd(
            Config::new(0x1234),
            device,
            fd as Arc<dyn DebugFd>,
        );
        assert!(matches!(result, Err(DebugError::NotReady)));
        assert!(!registry.is_attached(0x1234));
    }
}
