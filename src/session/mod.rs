//! Debug session lifecycle.
//!
//! [`DebugSession::attach`] opens the kernel debug channel for a process,
//! replays the resource state the kernel has queued for it and starts two
//! background threads:
//!
//! - the reader drains the channel into a raw record queue
//! - the worker decodes and handles queued records, issues deferred
//!   interrupts and synthesizes thread stop/unavailable events
//!
//! API calls share one session-wide state lock with the worker. Tile
//! sessions created by [`DebugSession::attach_tile`] share the root's
//! threads and bookkeeping and only carry their own event queue.

mod control;
mod handlers;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::connection::{ClientConnection, MAX_TILES};
use crate::error::{DebugError, Result};
use crate::events::{ApiEvent, DetachReason};
use crate::fd::DebugFd;
use crate::registry::SessionRegistry;
use crate::state_save::{DebugAreaHeader, RegsetProperties, RegsetType, StateSaveAreaHeader};
use crate::threads::{EuThread, ThreadId, ThreadSelector};
use crate::topology::DeviceInfo;
use crate::uapi;

/// Reader poll interval; also bounds shutdown latency.
const EVENT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);
/// Worker wait for the next queued kernel record.
const INTERNAL_EVENT_TIMEOUT: Duration = Duration::from_millis(100);
/// Records drained per poll wakeup.
const MAX_READS_PER_POLL: u32 = 3;

/// Address space of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Flat virtual address space of the debuggee.
    Default,
    /// Shared local memory, reachable per stopped thread only.
    Slm,
}

/// Target location of a memory access.
#[derive(Debug, Clone, Copy)]
pub struct MemorySpace {
    pub address: u64,
    pub kind: MemoryKind,
}

impl MemorySpace {
    pub fn at(address: u64) -> Self {
        Self {
            address,
            kind: MemoryKind::Default,
        }
    }
}

/// An interrupt request sent to the hardware, awaiting its attention
/// event.
#[derive(Debug, Clone)]
struct PendingInterrupt {
    selector: ThreadSelector,
    satisfied: bool,
}

/// Session bookkeeping behind the state lock.
#[derive(Default)]
struct SessionState {
    client_handle: Option<u64>,
    /// Client destroy handle, latched for device-lost detection.
    client_close_seen: Option<u64>,
    /// A second client registered; bookkeeping is no longer coherent.
    poisoned: bool,
    device_lost: bool,
    connections: HashMap<u64, ClientConnection>,
    /// Command queue UUID handle to device index.
    command_queues: HashMap<u64, u32>,
    root_events: VecDeque<ApiEvent>,
    tile_events: HashMap<u32, VecDeque<ApiEvent>>,
    attached_tiles: BTreeSet<u32>,
    /// Queued API events whose acknowledgment must echo to the kernel.
    events_to_ack: Vec<(ApiEvent, uapi::EventAck)>,
    threads: HashMap<ThreadId, EuThread>,
    newly_stopped: Vec<ThreadId>,
    interrupt_requests: Vec<ThreadSelector>,
    pending_interrupts: Vec<PendingInterrupt>,
    interrupt_sent: bool,
    interrupt_time: Option<Instant>,
    trigger_events: bool,
    expected_attention_events: u32,
    /// Last EU control seqno per tile; attention events older than this
    /// answer an earlier request. Zero means none issued yet.
    eu_control_seqno: [u64; MAX_TILES],
    state_save: Option<StateSaveAreaHeader>,
    debug_area: Option<DebugAreaHeader>,
}

impl SessionState {
    fn thread(&mut self, id: ThreadId) -> &mut EuThread {
        self.threads.entry(id).or_insert_with(|| EuThread::new(id))
    }

    fn connection(&mut self) -> Option<&mut ClientConnection> {
        let client = self.client_handle?;
        self.connections.get_mut(&client)
    }
}

/// State shared by the session handles and both background threads.
struct SessionCore {
    config: Config,
    device: DeviceInfo,
    fd: Arc<dyn DebugFd>,
    state: Mutex<SessionState>,
    /// Signals API event arrival; paired with `state`.
    api_cond: Condvar,
    raw_events: Mutex<VecDeque<Vec<u8>>>,
    /// Signals raw record arrival; paired with `raw_events`.
    raw_cond: Condvar,
    running: AtomicBool,
    detached: AtomicBool,
    registry: Option<Arc<SessionRegistry>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn locked<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SessionCore {
    fn new(
        config: Config,
        device: DeviceInfo,
        fd: Arc<dyn DebugFd>,
        registry: Option<Arc<SessionRegistry>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            device,
            fd,
            state: Mutex::new(SessionState::default()),
            api_cond: Condvar::new(),
            raw_events: Mutex::new(VecDeque::new()),
            raw_cond: Condvar::new(),
            running: AtomicBool::new(true),
            detached: AtomicBool::new(false),
            registry,
            reader: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        locked(&self.state)
    }

    fn lock_raw(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        locked(&self.raw_events)
    }

    // -- event routing ------------------------------------------------------

    /// Queues an event for the session that owns it: the tile's queue while
    /// that tile is attached, the root queue otherwise.
    fn push_api_event(&self, state: &mut SessionState, tile: Option<u32>, event: ApiEvent) {
        log::debug!("api event {:?} for tile {:?}", event, tile);
        match tile {
            Some(t) if state.attached_tiles.contains(&t) => {
                state.tile_events.entry(t).or_default().push_back(event);
            }
            _ => state.root_events.push_back(event),
        }
        self.api_cond.notify_all();
    }

    /// Queues a session-scoped event for the root and every attached tile.
    fn broadcast_api_event(&self, state: &mut SessionState, event: ApiEvent) {
        log::debug!("api event {:?} broadcast", event);
        for &t in &state.attached_tiles {
            state
                .tile_events
                .entry(t)
                .or_default()
                .push_back(event.clone());
        }
        state.root_events.push_back(event);
        self.api_cond.notify_all();
    }

    // -- reader thread ------------------------------------------------------

    fn reader_loop(&self) {
        log::debug!("event reader running");
        while self.running.load(Ordering::Acquire) {
            self.pump_kernel_events();
        }
        log::debug!("event reader exiting");
    }

    /// One poll cycle: waits for the channel and drains a few records into
    /// the raw queue. A poll rejected with EINVAL means the kernel
    /// invalidated the channel underneath us.
    fn pump_kernel_events(&self) {
        match self.fd.poll(EVENT_POLL_TIMEOUT) {
            Ok(true) => {
                for _ in 0..MAX_READS_PER_POLL {
                    let mut buf = vec![0u8; uapi::MAX_EVENT_SIZE];
                    let request = uapi::DebugEvent {
                        kind: uapi::EVENT_READ,
                        flags: 0,
                        seqno: 0,
                        size: uapi::MAX_EVENT_SIZE as u64,
                    };
                    let header = uapi::encode(&request);
                    buf[..header.len()].copy_from_slice(&header);

                    match self.fd.read_event(&mut buf) {
                        Ok(()) => {
                            let mut queue = self.lock_raw();
                            queue.push_back(buf);
                            self.raw_cond.notify_all();
                        }
                        Err(err) => {
                            log::debug!("event read stopped: {}", err);
                            break;
                        }
                    }
                }
            }
            Ok(false) => {}
            Err(err) => {
                let errno = err.raw_os_error().unwrap_or(0);
                if errno == libc::EINVAL && !self.detached.swap(true, Ordering::AcqRel) {
                    log::warn!("debug channel invalidated, reporting detach");
                    let mut state = self.lock_state();
                    self.broadcast_api_event(
                        &mut state,
                        ApiEvent::Detached {
                            reason: DetachReason::Invalidated,
                        },
                    );
                } else {
                    log::debug!("event poll failed: {}", err);
                }
            }
        }
    }

    // -- worker thread ------------------------------------------------------

    fn worker_loop(&self) {
        log::debug!("session worker running");
        while self.running.load(Ordering::Acquire) {
            self.process_one_record();
            self.send_interrupts();
            self.generate_events_and_resume_stopped_threads();
        }
        log::debug!("session worker exiting");
    }

    fn process_one_record(&self) {
        if let Some(bytes) = self.wait_internal_event(INTERNAL_EVENT_TIMEOUT) {
            self.handle_raw_event(&bytes);
        }
    }

    /// Pops the next queued kernel record, waiting up to `timeout` for one
    /// to arrive.
    fn wait_internal_event(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut queue = self.lock_raw();
        if let Some(bytes) = queue.pop_front() {
            return Some(bytes);
        }
        let (mut queue, _) = match self.raw_cond.wait_timeout(queue, timeout) {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    /// Attach replay is complete once the client and its module debug area
    /// bind are both known.
    fn all_events_collected(&self) -> bool {
        let state = self.lock_state();
        let Some(client) = state.client_handle else {
            return false;
        };
        state
            .connections
            .get(&client)
            .map(|conn| !conn.vm_to_module_debug_area.is_empty())
            .unwrap_or(false)
    }

    // -- teardown -----------------------------------------------------------

    fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            log::info!("session for pid {} shutting down", self.config.pid);
        }
        self.raw_cond.notify_all();
        self.api_cond.notify_all();

        let reader = locked(&self.reader).take();
        if let Some(handle) = reader {
            let _ = handle.join();
        }
        let worker = locked(&self.worker).take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }

        if let Some(registry) = &self.registry {
            registry.release(self.config.pid);
        }
    }
}

fn spawn_reader(core: &Arc<SessionCore>) -> Result<()> {
    let clone = Arc::clone(core);
    let handle = std::thread::Builder::new()
        .name("eud-reader".to_string())
        .spawn(move || clone.reader_loop())
        .map_err(|err| DebugError::Unknown(format!("spawning reader thread: {}", err)))?;
    *locked(&core.reader) = Some(handle);
    Ok(())
}

fn spawn_worker(core: &Arc<SessionCore>) -> Result<()> {
    let clone = Arc::clone(core);
    let handle = std::thread::Builder::new()
        .name("eud-worker".to_string())
        .spawn(move || clone.worker_loop())
        .map_err(|err| DebugError::Unknown(format!("spawning worker thread: {}", err)))?;
    *locked(&core.worker) = Some(handle);
    Ok(())
}

/// Handle to an attached debug session. The root session owns the kernel
/// channel; tile sessions borrow it.
pub struct DebugSession {
    core: Arc<SessionCore>,
    tile: Option<u32>,
}

impl DebugSession {
    /// Attaches to `config.pid` through the configured DRM render node.
    #[cfg(target_os = "linux")]
    pub fn attach(config: Config, device: DeviceInfo) -> Result<Self> {
        let fd = crate::fd::open_debug_fd(&config.device_path, config.pid).map_err(|err| {
            let errno = err.raw_os_error().unwrap_or(0);
            log::error!("debugger open for pid {} failed: {}", config.pid, err);
            DebugError::from_open_errno(errno)
        })?;
        Self::attach_with_fd(config, device, Arc::new(fd))
    }

    /// Attaches over an already open debug channel.
    pub fn attach_with_fd(config: Config, device: DeviceInfo, fd: Arc<dyn DebugFd>) -> Result<Self> {
        Self::attach_internal(config, device, fd, None)
    }

    pub(crate) fn attach_internal(
        config: Config,
        device: DeviceInfo,
        fd: Arc<dyn DebugFd>,
        registry: Option<Arc<SessionRegistry>>,
    ) -> Result<Self> {
        let core = SessionCore::new(config, device, fd, registry);
        log::info!("attaching to pid {}", core.config.pid);

        // The kernel queues the debuggee's state for replay the moment the
        // channel opens; nothing pending means the target is not ready.
        if !core.fd.poll(EVENT_POLL_TIMEOUT).unwrap_or(false) {
            core.shutdown();
            return Err(DebugError::NotReady);
        }

        if let Err(err) = spawn_reader(&core) {
            core.shutdown();
            return Err(err);
        }

        let mut all_collected = false;
        let mut event_available = true;
        while event_available && !all_collected {
            match core.wait_internal_event(INTERNAL_EVENT_TIMEOUT) {
                Some(bytes) => core.handle_raw_event(&bytes),
                None => event_available = false,
            }
            all_collected = core.all_events_collected();
        }

        {
            let state = core.lock_state();
            if state.client_handle.is_some() && state.client_close_seen == state.client_handle {
                drop(state);
                core.shutdown();
                return Err(DebugError::DeviceLost);
            }
        }

        if !all_collected {
            log::warn!("state replay incomplete for pid {}", core.config.pid);
            core.shutdown();
            return Err(DebugError::NotReady);
        }

        if let Err(err) = core.read_module_debug_area() {
            core.shutdown();
            return Err(err);
        }

        if let Err(err) = spawn_worker(&core) {
            core.shutdown();
            return Err(err);
        }
        log::info!("attached to pid {}", core.config.pid);
        Ok(Self { core, tile: None })
    }

    pub fn pid(&self) -> u64 {
        self.core.config.pid
    }

    /// Tile this session is scoped to; `None` for the root session.
    pub fn tile(&self) -> Option<u32> {
        self.tile
    }

    fn queue<'a>(&self, state: &'a mut SessionState) -> &'a mut VecDeque<ApiEvent> {
        match self.tile {
            Some(t) => state.tile_events.entry(t).or_default(),
            None => &mut state.root_events,
        }
    }

    /// Next queued event for this session. A `None` timeout blocks until an
    /// event arrives or the session shuts down.
    pub fn read_event(&self, timeout: Option<Duration>) -> Result<ApiEvent> {
        loop {
            let mut state = self.core.lock_state();
            if let Some(event) = self.queue(&mut state).pop_front() {
                return Ok(event);
            }
            if state.device_lost {
                return Err(DebugError::DeviceLost);
            }
            if state.poisoned {
                return Err(DebugError::Unknown(
                    "session state is incoherent".to_string(),
                ));
            }

            match timeout {
                Some(wait) => {
                    let (mut state, _) = match self.core.api_cond.wait_timeout(state, wait) {
                        Ok(pair) => pair,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if let Some(event) = self.queue(&mut state).pop_front() {
                        return Ok(event);
                    }
                    return Err(DebugError::NotReady);
                }
                None => {
                    if !self.core.running.load(Ordering::Acquire) {
                        return Err(DebugError::NotReady);
                    }
                    drop(
                        match self.core.api_cond.wait_timeout(state, INTERNAL_EVENT_TIMEOUT) {
                            Ok(pair) => pair.0,
                            Err(poisoned) => poisoned.into_inner().0,
                        },
                    );
                }
            }
        }
    }

    /// Acknowledges an event delivered with the ack-required flag, releasing
    /// the kernel resources held back for it.
    pub fn acknowledge_event(&self, event: &ApiEvent) -> Result<()> {
        self.root_only()?;
        self.core.acknowledge_event(event)
    }

    /// Requests a stop of the selected threads. The outcome arrives later as
    /// a thread-stopped or thread-unavailable event.
    pub fn interrupt(&self, thread: ThreadSelector) -> Result<()> {
        self.root_only()?;
        self.core.interrupt(thread)
    }

    /// Resumes previously stopped threads.
    pub fn resume(&self, thread: ThreadSelector) -> Result<()> {
        self.root_only()?;
        self.core.resume(thread)
    }

    pub fn read_memory(
        &self,
        thread: ThreadSelector,
        space: &MemorySpace,
        buf: &mut [u8],
    ) -> Result<()> {
        self.root_only()?;
        self.core.read_memory(thread, space, buf)
    }

    pub fn write_memory(
        &self,
        thread: ThreadSelector,
        space: &MemorySpace,
        data: &[u8],
    ) -> Result<()> {
        self.root_only()?;
        self.core.write_memory(thread, space, data)
    }

    /// Reads `count` registers of a set, starting at `start`, from a stopped
    /// thread.
    pub fn read_registers(
        &self,
        thread: ThreadSelector,
        kind: RegsetType,
        start: u32,
        count: u32,
    ) -> Result<Vec<u8>> {
        self.root_only()?;
        self.core.read_registers(thread, kind, start, count)
    }

    /// Writes registers of a set on a stopped thread. `values` must hold a
    /// whole number of registers.
    pub fn write_registers(
        &self,
        thread: ThreadSelector,
        kind: RegsetType,
        start: u32,
        values: &[u8],
    ) -> Result<()> {
        self.root_only()?;
        self.core.write_registers(thread, kind, start, values)
    }

    /// Shapes of the register sets threads of this session expose.
    pub fn register_set_properties(&self) -> Result<Vec<RegsetProperties>> {
        self.core.register_set_properties()
    }

    /// Opens a session scoped to one tile of a multi-tile device. Events
    /// for resources on that tile are routed to the new session.
    pub fn attach_tile(&self, tile: u32) -> Result<DebugSession> {
        if self.tile.is_some() {
            return Err(DebugError::UnsupportedFeature(
                "tile sessions cannot be subdivided".to_string(),
            ));
        }
        if !self.core.config.tile_attach {
            return Err(DebugError::UnsupportedFeature(
                "tile attach is disabled".to_string(),
            ));
        }
        let tiles = self.core.device.topology.tile_count;
        if tiles <= 1 {
            return Err(DebugError::UnsupportedFeature(
                "device has a single tile".to_string(),
            ));
        }
        if tile >= tiles {
            return Err(DebugError::InvalidArgument(format!(
                "tile {} of a {}-tile device",
                tile, tiles
            )));
        }

        let mut state = self.core.lock_state();
        if !state.attached_tiles.insert(tile) {
            return Err(DebugError::NotAvailable(format!(
                "tile {} already attached",
                tile
            )));
        }
        state.tile_events.entry(tile).or_default();
        log::info!("tile {} session attached", tile);
        Ok(DebugSession {
            core: Arc::clone(&self.core),
            tile: Some(tile),
        })
    }

    /// Detaches this session. The root session refuses while tile sessions
    /// are still attached; detaching a tile releases its slot.
    pub fn detach(&self) -> Result<()> {
        match self.tile {
            Some(tile) => {
                let mut state = self.core.lock_state();
                state.attached_tiles.remove(&tile);
                state.tile_events.remove(&tile);
                log::info!("tile {} session detached", tile);
                Ok(())
            }
            None => {
                {
                    let state = self.core.lock_state();
                    if !state.attached_tiles.is_empty() {
                        return Err(DebugError::NotAvailable(format!(
                            "{} tile sessions still attached",
                            state.attached_tiles.len()
                        )));
                    }
                }
                self.core.shutdown();
                Ok(())
            }
        }
    }

    fn root_only(&self) -> Result<()> {
        if self.tile.is_some() {
            return Err(DebugError::UnsupportedFeature(
                "operation not available on a tile session".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        match self.tile {
            Some(tile) => {
                let mut state = self.core.lock_state();
                state.attached_tiles.remove(&tile);
                state.tile_events.remove(&tile);
            }
            None => self.core.shutdown(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::fd::MockDebugFd;
    use crate::topology::DeviceTopology;

    /// Session over a mock channel, bypassing attach-time state replay.
    pub(crate) fn session_with_mock(tiles: u32) -> (DebugSession, Arc<MockDebugFd>) {
        let fd = Arc::new(MockDebugFd::new());
        let device = DeviceInfo::new(DeviceTopology::uniform(tiles, 2, 4, 8, 7));
        let core = SessionCore::new(
            Config::new(0x1234),
            device,
            fd.clone() as Arc<dyn DebugFd>,
            None,
        );
        (
            DebugSession {
                core,
                tile: None,
            },
            fd,
        )
    }

    /// Marks the client connection as established.
    pub(crate) fn install_client(session: &DebugSession, client: u64) {
        let mut state = session.core.lock_state();
        state.client_handle = Some(client);
        state
            .connections
            .insert(client, ClientConnection::new(client));
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{install_client, session_with_mock};
    use super::*;

    #[test]
    fn attach_is_not_ready_without_pending_events() {
        let (session, fd) = session_with_mock(1);
        let result = DebugSession::attach_with_fd(
            Config::new(0x1234),
            session.core.device.clone(),
            fd as Arc<dyn DebugFd>,
        );
        assert!(matches!(result, Err(DebugError::NotReady)));
    }

    #[test]
    fn read_event_times_out_then_pops() {
        let (session, _fd) = session_with_mock(1);
        let result = session.read_event(Some(Duration::from_millis(5)));
        assert!(matches!(result, Err(DebugError::NotReady)));

        {
            let mut state = session.core.lock_state();
            state.root_events.push_back(ApiEvent::ProcessEntry);
        }
        let event = session.read_event(Some(Duration::from_millis(5)));
        assert!(matches!(event, Ok(ApiEvent::ProcessEntry)));
    }

    #[test]
    fn queued_events_drain_before_terminal_condition() {
        let (session, _fd) = session_with_mock(1);
        {
            let mut state = session.core.lock_state();
            state.device_lost = true;
            state.root_events.push_back(ApiEvent::ProcessExit);
        }
        assert!(matches!(
            session.read_event(Some(Duration::from_millis(5))),
            Ok(ApiEvent::ProcessExit)
        ));
        assert!(matches!(
            session.read_event(Some(Duration::from_millis(5))),
            Err(DebugError::DeviceLost)
        ));
        assert!(matches!(
            session.read_event(Some(Duration::from_millis(5))),
            Err(DebugError::DeviceLost)
        ));
    }

    #[test]
    fn tile_attach_rules() {
        let (session, _fd) = session_with_mock(1);
        assert!(matches!(
            session.attach_tile(0),
            Err(DebugError::UnsupportedFeature(_))
        ));

        let (session, _fd) = session_with_mock(2);
        assert!(matches!(
            session.attach_tile(2),
            Err(DebugError::InvalidArgument(_))
        ));

        let tile = session.attach_tile(1).unwrap();
        assert_eq!(tile.tile(), Some(1));
        assert!(matches!(
            session.attach_tile(1),
            Err(DebugError::NotAvailable(_))
        ));
        assert!(matches!(
            tile.attach_tile(0),
            Err(DebugError::UnsupportedFeature(_))
        ));

        // Root detach is blocked until the tile lets go.
        assert!(matches!(
            session.detach(),
            Err(DebugError::NotAvailable(_))
        ));
        tile.detach().unwrap();
        session.detach().unwrap();
    }

    #[test]
    fn tile_events_route_to_attached_tile_only() {
        let (session, _fd) = session_with_mock(2);
        let tile = session.attach_tile(1).unwrap();

        {
            let mut state = session.core.lock_state();
            let load = ApiEvent::ModuleLoad {
                load: 0x1000,
                module_begin: 1,
                module_end: 2,
                needs_ack: false,
            };
            session.core.push_api_event(&mut state, Some(1), load);
            session
                .core
                .push_api_event(&mut state, Some(0), ApiEvent::ProcessEntry);
        }

        assert!(matches!(
            tile.read_event(Some(Duration::from_millis(5))),
            Ok(ApiEvent::ModuleLoad { load: 0x1000, .. })
        ));
        // Tile 0 is not attached, so its event lands on the root queue.
        assert!(matches!(
            session.read_event(Some(Duration::from_millis(5))),
            Ok(ApiEvent::ProcessEntry)
        ));
        assert!(matches!(
            session.read_event(Some(Duration::from_millis(5))),
            Err(DebugError::NotReady)
        ));
    }

    #[test]
    fn broadcast_reaches_root_and_tiles() {
        let (session, _fd) = session_with_mock(2);
        let tile = session.attach_tile(0).unwrap();

        {
            let mut state = session.core.lock_state();
            session
                .core
                .broadcast_api_event(&mut state, ApiEvent::ProcessExit);
        }
        assert!(matches!(
            session.read_event(Some(Duration::from_millis(5))),
            Ok(ApiEvent::ProcessExit)
        ));
        assert!(matches!(
            tile.read_event(Some(Duration::from_millis(5))),
            Ok(ApiEvent::ProcessExit)
        ));
    }

    #[test]
    fn tile_sessions_stub_data_plane_calls() {
        let (session, _fd) = session_with_mock(2);
        install_client(&session, 1);
        let tile = session.attach_tile(0).unwrap();

        let all = ThreadSelector::all();
        assert!(matches!(
            tile.interrupt(all),
            Err(DebugError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            tile.resume(all),
            Err(DebugError::UnsupportedFeature(_))
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            tile.read_memory(all, &MemorySpace::at(0x1000), &mut buf),
            Err(DebugError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            tile.write_memory(all, &MemorySpace::at(0x1000), &buf),
            Err(DebugError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            tile.read_registers(ThreadSelector::single(0, 0, 0, 0), RegsetType::Grf, 0, 1),
            Err(DebugError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            tile.acknowledge_event(&ApiEvent::ProcessEntry),
            Err(DebugError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn reader_queues_records_and_reports_invalidation() {
        let (session, fd) = session_with_mock(1);
        let record = uapi::encode(&uapi::DebugEventClient {
            base: uapi::DebugEvent {
                kind: uapi::EVENT_CLIENT,
                flags: uapi::FLAG_CREATE,
                seqno: 1,
                size: 32,
            },
            handle: 5,
        });
        fd.push_event(record);
        session.core.pump_kernel_events();
        assert!(session
            .core
            .wait_internal_event(Duration::from_millis(1))
            .is_some());

        fd.fail_next_poll(libc::EINVAL);
        session.core.pump_kernel_events();
        assert!(session.core.detached.load(Ordering::Acquire));
        assert!(matches!(
            session.read_event(Some(Duration::from_millis(5))),
            Ok(ApiEvent::Detached {
                reason: DetachReason::Invalidated
            })
        ));

        // A second invalidation does not repeat the event.
        fd.fail_next_poll(libc::EINVAL);
        session.core.pump_kernel_events();
        assert!(matches!(
            session.read_event(Some(Duration::from_millis(5))),
            Err(DebugError::NotReady)
        ));
    }

    #[test]
    fn infinite_wait_stops_with_the_session() {
        let (session, _fd) = session_with_mock(1);
        session.core.running.store(false, Ordering::Release);
        assert!(matches!(
            session.read_event(None),
            Err(DebugError::NotReady)
        ));
    }
}
