//! Debugger fd abstraction.
//!
//! Every kernel interaction of a session goes through [`DebugFd`]:
//!
//! - event stream reads and poll-based waiting
//! - UUID payload reads
//! - VM opens for target memory access
//! - EU control (interrupt, stopped query, resume)
//! - event acknowledgment
//!
//! The production implementation wraps the prelim debugger fd obtained from
//! a DRM render node. [`MockDebugFd`] drives the same session logic from
//! in-memory queues for tests and bring-up.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// UUID registration read back from the kernel.
#[derive(Debug, Clone)]
pub struct UuidInfo {
    /// 36-character UUID string.
    pub uuid: String,
    pub payload: Vec<u8>,
}

/// Channel to the kernel debugger interface for one debuggee process.
pub trait DebugFd: Send + Sync {
    /// Waits up to `timeout` for a pending event. `Ok(false)` is a timeout.
    fn poll(&self, timeout: Duration) -> io::Result<bool>;

    /// Fills `buf` with the next pending event. `buf` carries the
    /// read-request header on entry and the event on return.
    fn read_event(&self, buf: &mut [u8]) -> io::Result<()>;

    /// Reads the UUID string and payload behind a UUID handle.
    fn read_uuid(&self, client_handle: u64, handle: u64, payload_size: u64)
        -> io::Result<UuidInfo>;

    /// Opens a VM of the debuggee for direct memory access.
    fn open_vm(&self, client_handle: u64, vm_handle: u64, flags: u64) -> io::Result<Box<dyn VmFd>>;

    /// Issues an EU control command and returns the kernel seqno. The
    /// bitmask is an input for resume, an output for the stopped query and
    /// unused for interrupts.
    fn eu_control(
        &self,
        client_handle: u64,
        cmd: u32,
        engine: (u16, u16),
        bitmask: &mut [u8],
    ) -> io::Result<u64>;

    /// Acknowledges an event that was delivered with the ack-required flag.
    fn ack_event(&self, kind: u32, seqno: u64) -> io::Result<()>;
}

/// An open debuggee VM. Offsets are decanonized GPU VAs.
pub trait VmFd: Send {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
    /// Copies through a transient mapping instead of pread.
    fn mmap_read(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    /// Copies through a transient mapping instead of pwrite.
    fn mmap_write(&self, data: &[u8], offset: u64) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
pub use self::prelim::{open_debug_fd, PrelimDebugFd};

#[cfg(target_os = "linux")]
mod prelim {
    use super::{DebugFd, UuidInfo, VmFd};
    use crate::uapi;

    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::path::Path;
    use std::time::Duration;

    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;
    use nix::sys::uio::{pread, pwrite};

    fn last_errno() -> io::Error {
        io::Error::last_os_error()
    }

    /// Opens the prelim debugger fd for `pid` via the DRM render node.
    pub fn open_debug_fd(device: &Path, pid: u64) -> io::Result<PrelimDebugFd> {
        let raw = open(device, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let drm = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut param = uapi::DebuggerOpenParam {
            pid,
            ..Default::default()
        };
        let debug_fd = unsafe {
            libc::ioctl(
                drm.as_raw_fd(),
                uapi::IOCTL_DEBUGGER_OPEN as libc::c_ulong,
                &mut param as *mut _,
            )
        };
        if debug_fd < 0 {
            return Err(last_errno());
        }
        log::info!("debugger fd {} opened for pid {}", debug_fd, pid);
        Ok(PrelimDebugFd {
            fd: unsafe { OwnedFd::from_raw_fd(debug_fd) },
        })
    }

    /// Debugger fd backed by the prelim kernel interface.
    pub struct PrelimDebugFd {
        fd: OwnedFd,
    }

    impl PrelimDebugFd {
        fn ioctl<T>(&self, request: u64, arg: &mut T) -> io::Result<i32> {
            let rc = unsafe {
                libc::ioctl(self.fd.as_raw_fd(), request as libc::c_ulong, arg as *mut T)
            };
            if rc < 0 {
                return Err(last_errno());
            }
            Ok(rc)
        }
    }

    impl DebugFd for PrelimDebugFd {
        fn poll(&self, timeout: Duration) -> io::Result<bool> {
            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
            if rc < 0 {
                return Err(last_errno());
            }
            Ok(rc > 0)
        }

        fn read_event(&self, buf: &mut [u8]) -> io::Result<()> {
            let rc = unsafe {
                libc::ioctl(
                    self.fd.as_raw_fd(),
                    uapi::IOCTL_READ_EVENT as libc::c_ulong,
                    buf.as_mut_ptr(),
                )
            };
            if rc < 0 {
                return Err(last_errno());
            }
            Ok(())
        }

        fn read_uuid(
            &self,
            client_handle: u64,
            handle: u64,
            payload_size: u64,
        ) -> io::Result<UuidInfo> {
            let mut payload = vec![0u8; payload_size as usize];
            let mut arg = uapi::ReadUuid {
                client_handle,
                handle,
                payload_ptr: payload.as_mut_ptr() as u64,
                payload_size,
                ..Default::default()
            };
            self.ioctl(uapi::IOCTL_READ_UUID, &mut arg)?;
            let uuid = String::from_utf8_lossy(&{ arg.uuid }).into_owned();
            Ok(UuidInfo { uuid, payload })
        }

        fn open_vm(
            &self,
            client_handle: u64,
            vm_handle: u64,
            flags: u64,
        ) -> io::Result<Box<dyn VmFd>> {
            let mut arg = uapi::VmOpen {
                client_handle,
                handle: vm_handle,
                flags,
            };
            let vm_fd = self.ioctl(uapi::IOCTL_VM_OPEN, &mut arg)?;
            if vm_fd < 0 {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            Ok(Box::new(PrelimVmFd {
                fd: unsafe { OwnedFd::from_raw_fd(vm_fd) },
            }))
        }

        fn eu_control(
            &self,
            client_handle: u64,
            cmd: u32,
            engine: (u16, u16),
            bitmask: &mut [u8],
        ) -> io::Result<u64> {
            let mut arg = uapi::EuControl {
                client_handle,
                cmd,
                flags: 0,
                seqno: 0,
                ci: uapi::EngineClassInstance {
                    engine_class: engine.0,
                    engine_instance: engine.1,
                },
                bitmask_size: bitmask.len() as u32,
                bitmask_ptr: if bitmask.is_empty() {
                    0
                } else {
                    bitmask.as_mut_ptr() as u64
                },
            };
            self.ioctl(uapi::IOCTL_EU_CONTROL, &mut arg)?;
            Ok({ arg.seqno })
        }

        fn ack_event(&self, kind: u32, seqno: u64) -> io::Result<()> {
            let mut arg = uapi::EventAck {
                kind,
                flags: 0,
                seqno,
            };
            self.ioctl(uapi::IOCTL_ACK_EVENT, &mut arg)?;
            Ok(())
        }
    }

    struct PrelimVmFd {
        fd: OwnedFd,
    }

    impl PrelimVmFd {
        fn with_mapping<R>(
            &self,
            offset: u64,
            len: usize,
            prot: libc::c_int,
            f: impl FnOnce(*mut u8) -> R,
        ) -> io::Result<R> {
            let page = 4096u64;
            let aligned = offset & !(page - 1);
            let delta = (offset - aligned) as usize;
            let map_len = len + delta;

            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    map_len,
                    prot,
                    libc::MAP_SHARED,
                    self.fd.as_raw_fd(),
                    aligned as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(last_errno());
            }
            let result = f(unsafe { (ptr as *mut u8).add(delta) });
            unsafe { libc::munmap(ptr, map_len) };
            Ok(result)
        }
    }

    impl VmFd for PrelimVmFd {
        fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            pread(&self.fd, buf, offset as libc::off_t)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))
        }

        fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
            pwrite(&self.fd, buf, offset as libc::off_t)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))
        }

        fn mmap_read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
            self.with_mapping(offset, buf.len(), libc::PROT_READ, |src| unsafe {
                std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
            })
        }

        fn mmap_write(&self, data: &[u8], offset: u64) -> io::Result<()> {
            self.with_mapping(
                offset,
                data.len(),
                libc::PROT_READ | libc::PROT_WRITE,
                |dst| unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
                },
            )
        }
    }
}

// -- in-memory double -------------------------------------------------------

/// Recorded EU control invocation.
#[derive(Debug, Clone)]
pub struct EuControlCall {
    pub client_handle: u64,
    pub cmd: u32,
    pub engine: (u16, u16),
    pub bitmask: Vec<u8>,
}

/// In-memory debugger fd for tests and bring-up.
///
/// Events are served from a queue, UUID payloads from a table, VM accesses
/// from byte arrays. EU control and ack invocations are recorded for
/// inspection.
#[derive(Default)]
pub struct MockDebugFd {
    events: Mutex<VecDeque<Vec<u8>>>,
    poll_errors: Mutex<VecDeque<i32>>,
    uuids: Mutex<HashMap<u64, (String, Vec<u8>)>>,
    vms: Mutex<HashMap<u64, Arc<MockVmMemory>>>,
    opened_vms: Mutex<Vec<u64>>,
    eu_control_calls: Mutex<Vec<EuControlCall>>,
    eu_control_seqno: AtomicU64,
    eu_control_errno: Mutex<Option<i32>>,
    stopped_bitmask: Mutex<Vec<u8>>,
    acked: Mutex<Vec<(u32, u64)>>,
}

impl MockDebugFd {
    pub fn new() -> Self {
        let fd = Self::default();
        fd.eu_control_seqno.store(10, Ordering::Relaxed);
        fd
    }

    pub fn push_event(&self, bytes: Vec<u8>) {
        self.locked(&self.events).push_back(bytes);
    }

    /// Makes the next poll fail with the given errno.
    pub fn fail_next_poll(&self, errno: i32) {
        self.locked(&self.poll_errors).push_back(errno);
    }

    pub fn add_uuid(&self, handle: u64, uuid: &str, payload: Vec<u8>) {
        self.locked(&self.uuids)
            .insert(handle, (uuid.to_string(), payload));
    }

    /// Backs a VM handle with memory starting at decanonized `base`.
    pub fn add_vm(&self, vm_handle: u64, base: u64, data: Vec<u8>) -> Arc<MockVmMemory> {
        let memory = Arc::new(MockVmMemory::new(base, data));
        self.locked(&self.vms).insert(vm_handle, memory.clone());
        memory
    }

    pub fn opened_vms(&self) -> Vec<u64> {
        self.locked(&self.opened_vms).clone()
    }

    pub fn set_eu_control_seqno(&self, seqno: u64) {
        self.eu_control_seqno.store(seqno, Ordering::Relaxed);
    }

    pub fn fail_eu_control(&self, errno: i32) {
        *self.locked(&self.eu_control_errno) = Some(errno);
    }

    /// Bitmask returned by the stopped-threads query.
    pub fn set_stopped_bitmask(&self, bitmask: Vec<u8>) {
        *self.locked(&self.stopped_bitmask) = bitmask;
    }

    pub fn eu_control_calls(&self) -> Vec<EuControlCall> {
        self.locked(&self.eu_control_calls).clone()
    }

    pub fn acked_events(&self) -> Vec<(u32, u64)> {
        self.locked(&self.acked).clone()
    }

    fn locked<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DebugFd for MockDebugFd {
    fn poll(&self, _timeout: Duration) -> io::Result<bool> {
        if let Some(errno) = self.locked(&self.poll_errors).pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(!self.locked(&self.events).is_empty())
    }

    fn read_event(&self, buf: &mut [u8]) -> io::Result<()> {
        let event = self
            .locked(&self.events)
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let len = event.len().min(buf.len());
        buf[..len].copy_from_slice(&event[..len]);
        Ok(())
    }

    fn read_uuid(
        &self,
        _client_handle: u64,
        handle: u64,
        payload_size: u64,
    ) -> io::Result<UuidInfo> {
        let uuids = self.locked(&self.uuids);
        let (uuid, payload) = uuids
            .get(&handle)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let mut payload = payload.clone();
        payload.truncate(payload_size as usize);
        Ok(UuidInfo {
            uuid: uuid.clone(),
            payload,
        })
    }

    fn open_vm(
        &self,
        _client_handle: u64,
        vm_handle: u64,
        _flags: u64,
    ) -> io::Result<Box<dyn VmFd>> {
        let memory = self
            .locked(&self.vms)
            .get(&vm_handle)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        self.locked(&self.opened_vms).push(vm_handle);
        Ok(Box::new(MockVmFd { memory }))
    }

    fn eu_control(
        &self,
        client_handle: u64,
        cmd: u32,
        engine: (u16, u16),
        bitmask: &mut [u8],
    ) -> io::Result<u64> {
        if let Some(errno) = self.locked(&self.eu_control_errno).take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if cmd == crate::uapi::EU_CONTROL_CMD_STOPPED {
            let stopped = self.locked(&self.stopped_bitmask);
            let len = stopped.len().min(bitmask.len());
            bitmask[..len].copy_from_slice(&stopped[..len]);
        }
        self.locked(&self.eu_control_calls).push(EuControlCall {
            client_handle,
            cmd,
            engine,
            bitmask: bitmask.to_vec(),
        });
        Ok(self.eu_control_seqno.fetch_add(1, Ordering::Relaxed))
    }

    fn ack_event(&self, kind: u32, seqno: u64) -> io::Result<()> {
        self.locked(&self.acked).push((kind, seqno));
        Ok(())
    }
}

/// Byte-array target memory behind one mock VM handle.
pub struct MockVmMemory {
    base: u64,
    data: Mutex<Vec<u8>>,
    zero_progress_reads: AtomicUsize,
    zero_progress_writes: AtomicUsize,
    chunk_limit: AtomicUsize,
}

impl MockVmMemory {
    fn new(base: u64, data: Vec<u8>) -> Self {
        Self {
            base,
            data: Mutex::new(data),
            zero_progress_reads: AtomicUsize::new(0),
            zero_progress_writes: AtomicUsize::new(0),
            chunk_limit: AtomicUsize::new(usize::MAX),
        }
    }

    /// Makes the next `count` reads transfer zero bytes.
    pub fn stall_reads(&self, count: usize) {
        self.zero_progress_reads.store(count, Ordering::Relaxed);
    }

    /// Makes the next `count` writes transfer zero bytes.
    pub fn stall_writes(&self, count: usize) {
        self.zero_progress_writes.store(count, Ordering::Relaxed);
    }

    /// Caps bytes transferred per call, forcing partial progress.
    pub fn limit_chunk(&self, bytes: usize) {
        self.chunk_limit.store(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> Vec<u8> {
        match self.data.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<(usize, usize)> {
        let data_len = self.bytes_len();
        if offset < self.base || offset > self.base + data_len as u64 {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        let start = (offset - self.base) as usize;
        let n = len.min(data_len - start);
        Ok((start, n))
    }

    fn bytes_len(&self) -> usize {
        match self.data.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

struct MockVmFd {
    memory: Arc<MockVmMemory>,
}

impl MockVmFd {
    fn take_stall(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
    }
}

impl VmFd for MockVmFd {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if Self::take_stall(&self.memory.zero_progress_reads) {
            return Ok(0);
        }
        let limit = self.memory.chunk_limit.load(Ordering::Relaxed);
        let (start, n) = self.memory.range(offset, buf.len().min(limit))?;
        let data = match self.memory.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if Self::take_stall(&self.memory.zero_progress_writes) {
            return Ok(0);
        }
        let limit = self.memory.chunk_limit.load(Ordering::Relaxed);
        let (start, n) = self.memory.range(offset, buf.len().min(limit))?;
        let mut data = match self.memory.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        data[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn mmap_read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let (start, n) = self.memory.range(offset, buf.len())?;
        if n < buf.len() {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        let data = match self.memory.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buf.copy_from_slice(&data[start..start + n]);
        Ok(())
    }

    fn mmap_write(&self, data: &[u8], offset: u64) -> io::Result<()> {
        let (start, n) = self.memory.range(offset, data.len())?;
        if n < data.len() {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        let mut stored = match self.memory.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        stored[start..start + n].copy_from_slice(&data[..n]);
        Ok(())
    }
}
