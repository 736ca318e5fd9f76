//! Thread control and target access.
//!
//! Interrupts are asynchronous: [`SessionCore::interrupt`] only queues the
//! request. The worker issues queued interrupts through the EU control
//! ioctl, attention events mark what actually stopped, and a timeout turns
//! the remainder into thread-unavailable events. Stopped threads park in
//! the SIP state save area; register access addresses slots of it through
//! the VM the thread stopped under. The SBA register set has no slot and
//! is synthesized from the tracking buffer and r0.

use std::time::{Duration, Instant};

use crate::connection::{canonize, decanonize, IsaLookup, INVALID_HANDLE, MAX_TILES};
use crate::error::{DebugError, Result};
use crate::events::ApiEvent;
use crate::state_save::{
    surface_state_base_address, surface_state_pitch, DebugAreaHeader, RegsetDesc, RegsetProperties,
    RegsetType, SbaTrackedAddresses, SrIdent, StateSaveAreaHeader, RENDER_SURFACE_STATE_SIZE,
    SBA_COUNT, SIP_COMMAND_RESUME, SR_IDENT_MAGIC, STATE_SAVE_MAGIC,
};
use crate::threads::{ThreadId, ThreadSelector};
use crate::topology::apply_resume_wa;
use crate::uapi;

use super::{MemoryKind, MemorySpace, PendingInterrupt, SessionCore, SessionState};

/// CR0.1 bits SIP sets when a thread stops for a reportable reason. The
/// forced-exception bits are raised by the interrupt itself and do not
/// count as a reason.
const CR0_EXCEPTION_MASK: u32 = 0xfc00_0000;
const CR0_FORCED_EXCEPTION_MASK: u32 = 0x4400_0000;

/// Resume request bit understood by SIPs that predate the command slot.
const LEGACY_SIP_RESUME_BIT: u32 = 0x4000_0000;

/// Save-area generation polls before a resume is taken on faith.
const RESUME_VERIFY_ATTEMPTS: u32 = 100;

/// Direction of a save-area register transfer.
enum RegisterOp<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl SessionCore {
    // -- interrupts ---------------------------------------------------------

    /// Queues an interrupt of the selected threads. The worker issues it;
    /// the outcome arrives as a thread-stopped or thread-unavailable event.
    pub(super) fn interrupt(&self, selector: ThreadSelector) -> Result<()> {
        let mut state = self.lock_state();
        if self.are_requested_threads_stopped(&state, selector) {
            return Err(DebugError::NotAvailable(format!(
                "threads {} are already stopped",
                selector
            )));
        }
        if state
            .pending_interrupts
            .iter()
            .any(|pending| pending.selector == selector)
        {
            return Err(DebugError::NotReady);
        }
        log::debug!("interrupt of {} queued", selector);
        state.interrupt_requests.push(selector);
        Ok(())
    }

    fn are_requested_threads_stopped(&self, state: &SessionState, selector: ThreadSelector) -> bool {
        let topo = &self.device.topology;
        let tiles: Vec<u32> = match topo.tile_of(selector) {
            Some(tile) => vec![tile],
            None => (0..topo.tile_count).collect(),
        };
        for tile in tiles {
            for id in topo.resolve(tile, selector) {
                let stopped = state
                    .threads
                    .get(&id)
                    .map(|thread| thread.is_stopped())
                    .unwrap_or(false);
                if !stopped {
                    return false;
                }
            }
        }
        true
    }

    /// Turns queued interrupt requests into EU control interrupts, one per
    /// addressed tile. Runs on the worker; a wave stays outstanding until
    /// its events are generated.
    pub(super) fn send_interrupts(&self) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.interrupt_sent {
            return;
        }
        for selector in state.interrupt_requests.drain(..) {
            state.pending_interrupts.push(PendingInterrupt {
                selector,
                satisfied: false,
            });
        }
        if state.pending_interrupts.is_empty() {
            return;
        }

        state.expected_attention_events = 0;
        let tiles = self.device.topology.tile_count;
        if tiles == 1 {
            match self.interrupt_tile(state, 0) {
                Ok(()) => {
                    state.interrupt_time = Some(Instant::now());
                    state.interrupt_sent = true;
                }
                Err(err) => {
                    log::warn!("interrupt failed: {}", err);
                    self.generate_events_for_pending_interrupts(state);
                }
            }
            return;
        }

        let mut addressed = vec![false; tiles as usize];
        for pending in &state.pending_interrupts {
            match self.device.topology.tile_of(pending.selector) {
                Some(tile) => addressed[tile as usize] = true,
                None => addressed.iter_mut().for_each(|tile| *tile = true),
            }
        }
        for tile in 0..tiles {
            if !addressed[tile as usize] {
                continue;
            }
            match self.interrupt_tile(state, tile) {
                Ok(()) => state.expected_attention_events += 1,
                Err(err) => log::warn!("interrupt on tile {} failed: {}", tile, err),
            }
        }
        if state.expected_attention_events == 0 {
            self.generate_events_for_pending_interrupts(state);
        } else {
            state.interrupt_time = Some(Instant::now());
            state.interrupt_sent = true;
        }
    }

    fn interrupt_tile(&self, state: &mut SessionState, tile: u32) -> Result<()> {
        self.thread_control(state, tile, &[], uapi::EU_CONTROL_CMD_INTERRUPT_ALL)
            .map(|_| ())
    }

    /// Arms event generation once the outstanding wave has nothing left to
    /// wait for: every pending interrupt saw its threads stop, or no more
    /// attention events are expected.
    pub(super) fn check_trigger_events_for_attention(&self, state: &mut SessionState) {
        if state.pending_interrupts.is_empty() && state.newly_stopped.is_empty() {
            return;
        }
        let all_satisfied = state
            .pending_interrupts
            .iter()
            .all(|pending| pending.satisfied);
        if all_satisfied || state.expected_attention_events == 0 {
            state.trigger_events = true;
        }
    }

    /// Settles the outstanding interrupt wave: triages newly stopped
    /// threads, quietly resumes the ones that stopped by accident and
    /// reports the rest. An expired interrupt timeout forces settlement.
    pub(super) fn generate_events_and_resume_stopped_threads(&self) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.interrupt_sent && !state.trigger_events {
            let expired = state
                .interrupt_time
                .map(|sent| sent.elapsed() > self.config.interrupt_timeout)
                .unwrap_or(false);
            if expired {
                log::debug!(
                    "no attention within {:?}, settling interrupt wave",
                    self.config.interrupt_timeout
                );
                state.trigger_events = true;
                state.interrupt_time = Some(Instant::now());
            }
        }
        if !state.trigger_events {
            return;
        }

        let (resume, report) = self.triage_newly_stopped(state);
        self.resume_accidentally_stopped(state, &resume);
        self.generate_events_for_pending_interrupts(state);
        for &id in &report {
            let (slice, subslice, eu, thread) = self.device.topology.to_api(id);
            self.push_api_event(
                state,
                Some(id.tile),
                ApiEvent::ThreadStopped {
                    thread: ThreadSelector::single(slice, subslice, eu, thread),
                },
            );
        }
        state.interrupt_sent = false;
        state.trigger_events = false;
    }

    /// Splits newly stopped threads into accidental stops to resume and
    /// real stops to report, by the exception bits in saved CR0.1. An
    /// unreadable register image counts as accidental.
    fn triage_newly_stopped(&self, state: &mut SessionState) -> (Vec<ThreadId>, Vec<ThreadId>) {
        let mut resume = Vec::new();
        let mut report = Vec::new();
        if state.newly_stopped.is_empty() {
            return (resume, report);
        }

        let header = self.state_save_header(state);
        let newly = std::mem::take(&mut state.newly_stopped);
        for id in newly {
            let stopped = state
                .threads
                .get(&id)
                .map(|thread| thread.is_stopped())
                .unwrap_or(false);
            if !stopped {
                continue;
            }
            let mut cr0_1 = 0;
            if let Some(header) = &header {
                let desc = *header.regset(RegsetType::Cr);
                let mut reg = vec![0u8; desc.bytes as usize];
                let _ = self.registers_access(
                    state,
                    header,
                    id,
                    &desc,
                    0,
                    1,
                    RegisterOp::Read(&mut reg),
                );
                cr0_1 = dword(&reg, 1);
            }
            if cr0_1 & CR0_EXCEPTION_MASK & !CR0_FORCED_EXCEPTION_MASK == 0 {
                resume.push(id);
            } else {
                report.push(id);
            }
        }
        (resume, report)
    }

    fn resume_accidentally_stopped(&self, state: &mut SessionState, threads: &[ThreadId]) {
        if threads.is_empty() {
            return;
        }
        let mut per_tile: [Vec<ThreadId>; MAX_TILES] = Default::default();
        for &id in threads {
            per_tile[(id.tile as usize).min(MAX_TILES - 1)].push(id);
        }
        for (tile, ids) in per_tile.iter().enumerate() {
            if ids.is_empty() {
                continue;
            }
            log::debug!(
                "resuming {} accidentally stopped threads on tile {}",
                ids.len(),
                tile
            );
            self.write_resume_commands(state, ids);
            if let Err(err) =
                self.thread_control(state, tile as u32, ids, uapi::EU_CONTROL_CMD_RESUME)
            {
                log::warn!("resume on tile {} failed: {}", tile, err);
            }
            for &id in ids {
                self.wait_thread_resumed(state, id);
                state.thread(id).resume();
            }
        }
    }

    /// Reports the outcome of every pending interrupt and retires the wave.
    fn generate_events_for_pending_interrupts(&self, state: &mut SessionState) {
        let pending: Vec<PendingInterrupt> = state.pending_interrupts.drain(..).collect();
        for interrupt in pending {
            let tile = self.device.topology.tile_of(interrupt.selector);
            let event = if interrupt.satisfied {
                ApiEvent::ThreadStopped {
                    thread: interrupt.selector,
                }
            } else {
                log::info!("no threads stopped for interrupt of {}", interrupt.selector);
                ApiEvent::ThreadUnavailable {
                    thread: interrupt.selector,
                }
            };
            self.push_api_event(state, tile, event);
        }
    }

    // -- resume -------------------------------------------------------------

    /// Resumes the stopped threads the selector covers.
    pub(super) fn resume(&self, selector: ThreadSelector) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        match self.device.topology.tile_of(selector) {
            Some(tile) => self.resume_within_tile(state, tile, selector),
            None => {
                let mut failure = None;
                let mut all_running = true;
                for tile in 0..self.device.topology.tile_count {
                    match self.resume_within_tile(state, tile, selector) {
                        Ok(()) => all_running = false,
                        Err(DebugError::NotAvailable(_)) => {}
                        Err(err) => {
                            log::warn!("resume on tile {} failed: {}", tile, err);
                            failure = Some(err);
                            all_running = false;
                        }
                    }
                }
                if all_running {
                    return Err(DebugError::NotAvailable(format!(
                        "no stopped threads match {}",
                        selector
                    )));
                }
                match failure {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }

    fn resume_within_tile(
        &self,
        state: &mut SessionState,
        tile: u32,
        selector: ThreadSelector,
    ) -> Result<()> {
        let stopped: Vec<ThreadId> = self
            .device
            .topology
            .resolve(tile, selector)
            .into_iter()
            .filter(|id| {
                state
                    .threads
                    .get(id)
                    .map(|thread| thread.is_stopped())
                    .unwrap_or(false)
            })
            .collect();
        if stopped.is_empty() {
            return Err(DebugError::NotAvailable(format!(
                "no stopped threads match {} on tile {}",
                selector, tile
            )));
        }
        log::debug!("resuming {} threads on tile {}", stopped.len(), tile);

        let wrote = self.write_resume_commands(state, &stopped);
        let control = self.thread_control(state, tile, &stopped, uapi::EU_CONTROL_CMD_RESUME);
        // Threads are marked running regardless; a failed resume leaves
        // them to the next attention event.
        for &id in &stopped {
            self.wait_thread_resumed(state, id);
            state.thread(id).resume();
        }

        if let Err(err) = control {
            return Err(DebugError::Unknown(format!(
                "resume of {} on tile {}: {}",
                selector, tile, err
            )));
        }
        if !wrote {
            return Err(DebugError::Unknown(format!(
                "resume command write failed for {}",
                selector
            )));
        }
        Ok(())
    }

    /// Arms the resume request in every thread's save-area slot. Current
    /// SIPs take a command; older ones poll a register bit instead, with
    /// its location depending on whether the SIP is bindless.
    fn write_resume_commands(&self, state: &mut SessionState, threads: &[ThreadId]) -> bool {
        let Some(header) = self.state_save_header(state) else {
            return false;
        };
        let mut ok = true;

        if header.has_sip_command() {
            let desc = header.regs.cmd;
            let mut slot = vec![0u8; desc.bytes as usize];
            set_dword(&mut slot, 0, SIP_COMMAND_RESUME);
            for &id in threads {
                if let Err(err) =
                    self.registers_access(state, &header, id, &desc, 0, 1, RegisterOp::Write(&slot))
                {
                    log::error!("resume command write for {} failed: {}", id, err);
                    ok = false;
                }
            }
            return ok;
        }

        if !self.device.resume_wa {
            return true;
        }
        let bindless = state
            .debug_area
            .map(|area| area.is_shared())
            .unwrap_or(false);
        let (desc, index) = if bindless {
            (header.regs.cr, 1)
        } else {
            (header.regs.grf, 4)
        };
        for &id in threads {
            let mut reg = vec![0u8; desc.bytes as usize];
            if let Err(err) =
                self.registers_access(state, &header, id, &desc, 0, 1, RegisterOp::Read(&mut reg))
            {
                log::error!("resume register read for {} failed: {}", id, err);
                ok = false;
                continue;
            }
            let value = dword(&reg, index) | LEGACY_SIP_RESUME_BIT;
            set_dword(&mut reg, index, value);
            if let Err(err) =
                self.registers_access(state, &header, id, &desc, 0, 1, RegisterOp::Write(&reg))
            {
                log::error!("resume register write for {} failed: {}", id, err);
                ok = false;
            }
        }
        ok
    }

    fn wait_thread_resumed(&self, state: &mut SessionState, id: ThreadId) {
        for _ in 0..RESUME_VERIFY_ATTEMPTS {
            if self.check_thread_resumed(state, id) {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        log::warn!("thread {} keeps its save-area generation after resume", id);
    }

    /// Whether a thread left the system routine since its recorded stop.
    /// Anything that prevents the check counts as resumed.
    fn check_thread_resumed(&self, state: &mut SessionState, id: ThreadId) -> bool {
        let Some(header) = self.state_save_header(state) else {
            return true;
        };
        if !header.has_sip_command() {
            // Old SIPs do not update the generation counter on exit.
            return true;
        }
        let Some(vm) = state.threads.get(&id).and_then(|thread| thread.memory_handle()) else {
            return true;
        };
        let Some(ident) = self.read_system_routine_ident(state, id, vm) else {
            return true;
        };
        if ident.magic != SR_IDENT_MAGIC {
            return true;
        }
        ident.count != state.thread(id).last_counter()
    }

    /// Raw read of a thread's save-area identification marker. The caller
    /// owns any magic validation.
    pub(super) fn read_system_routine_ident(
        &self,
        state: &mut SessionState,
        id: ThreadId,
        vm: u64,
    ) -> Option<SrIdent> {
        let header = self.state_save_header(state)?;
        let client = state.client_handle?;
        let gpu_va = state
            .connections
            .get(&client)
            .and_then(|conn| conn.vm_to_context_save_area.get(&vm))
            .map(|bind| bind.gpu_va)
            .unwrap_or(0);
        if gpu_va == 0 {
            return None;
        }
        let mut bytes = [0u8; SrIdent::SIZE];
        self.read_gpu_memory(client, vm, gpu_va + header.sr_ident_offset(id), &mut bytes)
            .ok()?;
        uapi::decode_prefix::<SrIdent>(&bytes)
    }

    // -- EU control ---------------------------------------------------------

    /// Issues one EU control command against a tile's compute engine and
    /// records the seqno of interrupt commands for attention matching.
    fn thread_control(
        &self,
        state: &mut SessionState,
        tile: u32,
        threads: &[ThreadId],
        cmd: u32,
    ) -> Result<u64> {
        let Some(client) = state.client_handle else {
            return Err(DebugError::Uninitialized(
                "no client connection".to_string(),
            ));
        };
        let topo = &self.device.topology;
        let mut bitmask = match cmd {
            uapi::EU_CONTROL_CMD_INTERRUPT_ALL => Vec::new(),
            uapi::EU_CONTROL_CMD_RESUME => {
                let mut mask = topo.bitmask_from_threads(threads);
                if self.device.resume_wa {
                    apply_resume_wa(&mut mask);
                }
                mask
            }
            _ => topo.bitmask_from_threads(threads),
        };

        let engine = self.device.control_engine(tile);
        let interrupt = matches!(
            cmd,
            uapi::EU_CONTROL_CMD_INTERRUPT | uapi::EU_CONTROL_CMD_INTERRUPT_ALL
        );
        let slot = (tile as usize).min(MAX_TILES - 1);
        match self.fd.eu_control(client, cmd, engine, &mut bitmask) {
            Ok(seqno) => {
                log::debug!("eu control cmd {} on tile {} seqno {}", cmd, tile, seqno);
                if interrupt {
                    state.eu_control_seqno[slot] = seqno;
                }
                Ok(seqno)
            }
            Err(err) => {
                log::error!("eu control cmd {} on tile {} failed: {}", cmd, tile, err);
                if interrupt {
                    state.eu_control_seqno[slot] = INVALID_HANDLE;
                }
                Err(DebugError::NotAvailable(format!(
                    "eu control failed: {}",
                    err
                )))
            }
        }
    }

    // -- registers ----------------------------------------------------------

    pub(super) fn read_registers(
        &self,
        selector: ThreadSelector,
        kind: RegsetType,
        start: u32,
        count: u32,
    ) -> Result<Vec<u8>> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let id = self.single_thread(selector)?;
        self.require_stopped(state, id)?;
        let Some(header) = self.state_save_header(state) else {
            return Err(DebugError::Unknown("no state save area".to_string()));
        };
        if kind == RegsetType::Sba {
            return self.read_sba_registers(state, &header, id, start, count);
        }
        header.register_offset(kind, start, count)?;
        let desc = *header.regset(kind);
        let mut values = vec![0u8; count as usize * desc.bytes as usize];
        self.registers_access(
            state,
            &header,
            id,
            &desc,
            start,
            count,
            RegisterOp::Read(&mut values),
        )?;
        Ok(values)
    }

    pub(super) fn write_registers(
        &self,
        selector: ThreadSelector,
        kind: RegsetType,
        start: u32,
        values: &[u8],
    ) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let id = self.single_thread(selector)?;
        self.require_stopped(state, id)?;
        let Some(header) = self.state_save_header(state) else {
            return Err(DebugError::Unknown("no state save area".to_string()));
        };
        if !kind.is_writeable() {
            return Err(DebugError::InvalidArgument(format!(
                "{:?} registers are read-only",
                kind
            )));
        }
        let desc = *header.regset(kind);
        if desc.bytes == 0 || values.len() % desc.bytes as usize != 0 {
            return Err(DebugError::InvalidArgument(format!(
                "{} bytes is not a whole number of {:?} registers",
                values.len(),
                kind
            )));
        }
        let count = (values.len() / desc.bytes as usize) as u32;
        self.registers_access(
            state,
            &header,
            id,
            &desc,
            start,
            count,
            RegisterOp::Write(values),
        )
    }

    /// Shapes of the register sets the target's SIP exposes.
    pub(super) fn register_set_properties(&self) -> Result<Vec<RegsetProperties>> {
        let mut state = self.lock_state();
        let Some(header) = self.state_save_header(&mut state) else {
            return Err(DebugError::Uninitialized(
                "state save area not located yet".to_string(),
            ));
        };
        Ok(header.regset_properties())
    }

    fn single_thread(&self, selector: ThreadSelector) -> Result<ThreadId> {
        if !selector.is_single() {
            return Err(DebugError::NotAvailable(format!(
                "{} does not name a single thread",
                selector
            )));
        }
        let topo = &self.device.topology;
        let tile = topo.tile_of(selector).unwrap_or(0);
        topo.resolve(tile, selector).into_iter().next().ok_or_else(|| {
            DebugError::InvalidArgument(format!("{} is outside the device topology", selector))
        })
    }

    fn require_stopped(&self, state: &SessionState, id: ThreadId) -> Result<()> {
        let stopped = state
            .threads
            .get(&id)
            .map(|thread| thread.is_stopped())
            .unwrap_or(false);
        if !stopped {
            return Err(DebugError::NotAvailable(format!(
                "thread {} is not stopped",
                id
            )));
        }
        Ok(())
    }

    /// Transfers registers of one set between the caller and a stopped
    /// thread's save-area slot. Validates the slot against both area and
    /// per-thread markers before touching it.
    fn registers_access(
        &self,
        state: &SessionState,
        header: &StateSaveAreaHeader,
        id: ThreadId,
        desc: &RegsetDesc,
        start: u32,
        count: u32,
        op: RegisterOp<'_>,
    ) -> Result<()> {
        if start >= desc.num || u64::from(start) + u64::from(count) > u64::from(desc.num) {
            return Err(DebugError::InvalidArgument(format!(
                "register range {}..{} outside set of {}",
                start,
                u64::from(start) + u64::from(count),
                desc.num
            )));
        }
        let Some(client) = state.client_handle else {
            return Err(DebugError::Uninitialized(
                "no client connection".to_string(),
            ));
        };
        let Some(vm) = state.threads.get(&id).and_then(|thread| thread.memory_handle()) else {
            return Err(DebugError::Unknown(format!(
                "thread {} has no memory handle",
                id
            )));
        };
        let gpu_va = state
            .connections
            .get(&client)
            .and_then(|conn| conn.vm_to_context_save_area.get(&vm))
            .map(|bind| bind.gpu_va)
            .unwrap_or(0);
        if gpu_va == 0 {
            return Err(DebugError::Unknown(format!(
                "no context save area for vm {:#x}",
                vm
            )));
        }

        let mut magic = [0u8; 8];
        self.read_gpu_memory(client, vm, gpu_va, &mut magic)?;
        if magic != STATE_SAVE_MAGIC {
            log::error!("save area at {:#x} lost its magic", gpu_va);
            return Err(DebugError::Unknown(
                "state save area magic mismatch".to_string(),
            ));
        }
        let mut ident = [0u8; SrIdent::SIZE];
        self.read_gpu_memory(client, vm, gpu_va + header.sr_ident_offset(id), &mut ident)?;
        if SrIdent::parse(&ident).is_err() {
            log::error!("thread {} is not inside the system routine", id);
            return Err(DebugError::Unknown(format!(
                "thread {} not in system routine",
                id
            )));
        }

        let offset = gpu_va
            + header.thread_slot_offset(id)
            + u64::from(desc.offset)
            + u64::from(desc.bytes) * u64::from(start);
        match op {
            RegisterOp::Read(buf) => self.read_gpu_memory(client, vm, offset, buf),
            RegisterOp::Write(data) => self.write_gpu_memory(client, vm, offset, data),
        }
    }

    /// Builds the SBA register set for a thread: tracked base addresses
    /// plus the binding table and scratch pointers derived from saved r0.
    fn read_sba_registers(
        &self,
        state: &SessionState,
        header: &StateSaveAreaHeader,
        id: ThreadId,
        start: u32,
        count: u32,
    ) -> Result<Vec<u8>> {
        if start >= SBA_COUNT || u64::from(start) + u64::from(count) > u64::from(SBA_COUNT) {
            return Err(DebugError::InvalidArgument(format!(
                "register range {}..{} outside set of {}",
                start,
                u64::from(start) + u64::from(count),
                SBA_COUNT
            )));
        }
        let sba = self.read_sba_buffer(state, id)?;

        let grf = *header.regset(RegsetType::Grf);
        let mut r0 = vec![0u8; grf.bytes as usize];
        self.registers_access(state, header, id, &grf, 0, 1, RegisterOp::Read(&mut r0))?;

        let binding_table = ((u64::from(dword(&r0, 4)) >> 5) << 5) + sba.surface_state_base;
        let mut scratch = 0u64;
        if self.device.scratch_via_surface_state {
            let surface_offset = (u64::from(dword(&r0, 5)) >> 10) << 6;
            if surface_offset > 0 {
                let Some(client) = state.client_handle else {
                    return Err(DebugError::Uninitialized(
                        "no client connection".to_string(),
                    ));
                };
                let Some(vm) = state.threads.get(&id).and_then(|thread| thread.memory_handle())
                else {
                    return Err(DebugError::NotAvailable(format!(
                        "thread {} is not stopped under a vm",
                        id
                    )));
                };
                let mut surface_state = [0u8; RENDER_SURFACE_STATE_SIZE];
                self.read_gpu_memory(
                    client,
                    vm,
                    surface_offset + sba.surface_state_base,
                    &mut surface_state,
                )?;
                let pitch = surface_state_pitch(&surface_state);
                let base = decanonize(surface_state_base_address(&surface_state));
                if base != 0 {
                    scratch = self.device.topology.per_thread_scratch_offset(pitch, id) + base;
                }
            }
        } else {
            let pointer = (u64::from(dword(&r0, 5)) >> 10) << 10;
            if pointer != 0 {
                scratch = pointer + sba.general_state_base;
            }
        }

        let values = [
            sba.general_state_base,
            sba.surface_state_base,
            sba.dynamic_state_base,
            sba.indirect_object_base,
            sba.instruction_base,
            sba.bindless_surface_state_base,
            sba.bindless_sampler_state_base,
            binding_table,
            scratch,
        ];
        log::debug!(
            "sba registers for {}: binding table {:#x}, scratch {:#x}",
            id,
            binding_table,
            scratch
        );
        let mut out = Vec::with_capacity(count as usize * 8);
        for value in &values[start as usize..(start + count) as usize] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        Ok(out)
    }

    fn read_sba_buffer(&self, state: &SessionState, id: ThreadId) -> Result<SbaTrackedAddresses> {
        let Some(client) = state.client_handle else {
            return Err(DebugError::Uninitialized(
                "no client connection".to_string(),
            ));
        };
        let Some(vm) = state.threads.get(&id).and_then(|thread| thread.memory_handle()) else {
            return Err(DebugError::NotAvailable(format!(
                "thread {} is not stopped under a vm",
                id
            )));
        };
        let gpu_va = state
            .connections
            .get(&client)
            .and_then(|conn| conn.vm_to_sba.get(&vm))
            .map(|bind| bind.gpu_va)
            .unwrap_or(0);
        if gpu_va == 0 {
            return Err(DebugError::Unknown(format!(
                "no sba tracking buffer for vm {:#x}",
                vm
            )));
        }
        let mut bytes = [0u8; SbaTrackedAddresses::SIZE];
        self.read_gpu_memory(client, vm, gpu_va, &mut bytes)?;
        SbaTrackedAddresses::parse(&bytes)
    }

    // -- per-process areas --------------------------------------------------

    /// Reads and validates the module debug area header. Attach fails
    /// without it; the bindless flag steers legacy resume later.
    pub(super) fn read_module_debug_area(&self) -> Result<()> {
        let mut state = self.lock_state();
        let Some(client) = state.client_handle else {
            return Err(DebugError::Uninitialized(
                "no client connection".to_string(),
            ));
        };
        let Some((vm, gpu_va)) = state.connections.get(&client).and_then(|conn| {
            conn.vm_to_module_debug_area
                .iter()
                .next()
                .map(|(&vm, bind)| (vm, bind.gpu_va))
        }) else {
            return Err(DebugError::Unknown(
                "no module debug area bound".to_string(),
            ));
        };

        let mut bytes = [0u8; DebugAreaHeader::SIZE];
        self.read_gpu_memory(client, vm, gpu_va, &mut bytes)?;
        let header = DebugAreaHeader::parse(&bytes).map_err(|err| {
            log::error!("module debug area at {:#x} is corrupted", gpu_va);
            err
        })?;
        log::debug!(
            "module debug area version {}, shared {}",
            header.version,
            header.is_shared()
        );
        state.debug_area = Some(header);
        Ok(())
    }

    /// State save area header, read and cached on first use. `None` until
    /// a context save area bind is known and its header parses.
    fn state_save_header(&self, state: &mut SessionState) -> Option<StateSaveAreaHeader> {
        if let Some(header) = state.state_save {
            return Some(header);
        }
        let client = state.client_handle?;
        let conn = state.connections.get(&client)?;
        let (&vm, bind) = conn.vm_to_context_save_area.iter().next()?;
        let (gpu_va, total) = (bind.gpu_va, bind.size);
        if gpu_va == 0 {
            return None;
        }
        let header_size = std::mem::size_of::<StateSaveAreaHeader>();
        if (total as usize) < header_size {
            log::error!("context save area of {} bytes cannot hold its header", total);
            return None;
        }

        let mut bytes = vec![0u8; header_size];
        if let Err(err) = self.read_gpu_memory(client, vm, gpu_va, &mut bytes) {
            log::error!("state save header at {:#x} unreadable: {}", gpu_va, err);
            return None;
        }
        match StateSaveAreaHeader::parse(&bytes) {
            Ok(header) => {
                log::info!(
                    "sip version {}.{}.{}",
                    header.version.version.major,
                    header.version.version.minor,
                    header.version.version.patch
                );
                state.state_save = Some(header);
                Some(header)
            }
            Err(err) => {
                log::error!("state save header at {:#x}: {}", gpu_va, err);
                None
            }
        }
    }

    // -- memory access ------------------------------------------------------

    pub(super) fn read_memory(
        &self,
        selector: ThreadSelector,
        space: &MemorySpace,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(client) = state.client_handle else {
            return Err(DebugError::Uninitialized(
                "no client connection".to_string(),
            ));
        };
        self.validate_memory_access(state, selector, space)?;

        let access_va = decanonize(space.address);
        let len = buf.len() as u64;

        let isa_vms = self.isa_vm_handles(state, client, access_va, len)?;
        if let Some(&vm) = isa_vms.first() {
            return self.read_gpu_memory(client, vm, space.address, buf);
        }

        if let Some(conn) = state.connections.get(&client) {
            if let Some((handle, offset)) = conn.find_elf(access_va, len) {
                if let Some(data) = conn.uuids.get(&handle) {
                    let start = offset as usize;
                    buf.copy_from_slice(&data.payload[start..start + buf.len()]);
                    return Ok(());
                }
            }
            if conn.find_elf(access_va, 1).is_some() {
                return Err(DebugError::InvalidArgument(
                    "read runs past the module image end".to_string(),
                ));
            }
        }

        if selector.is_all() {
            return self.for_each_vm(state, client, space.address, |vm| {
                self.read_gpu_memory(client, vm, space.address, buf)
            });
        }

        let id = self.single_thread(selector)?;
        let Some(vm) = state.threads.get(&id).and_then(|thread| thread.memory_handle()) else {
            return Err(DebugError::NotAvailable(format!(
                "thread {} is not stopped under a vm",
                id
            )));
        };
        self.read_gpu_memory(client, vm, space.address, buf)
    }

    pub(super) fn write_memory(
        &self,
        selector: ThreadSelector,
        space: &MemorySpace,
        data: &[u8],
    ) -> Result<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(client) = state.client_handle else {
            return Err(DebugError::Uninitialized(
                "no client connection".to_string(),
            ));
        };
        self.validate_memory_access(state, selector, space)?;

        let access_va = decanonize(space.address);
        let len = data.len() as u64;

        // ISA lives once per tile; a write lands in every instance.
        let isa_vms = self.isa_vm_handles(state, client, access_va, len)?;
        if !isa_vms.is_empty() {
            for vm in isa_vms {
                self.write_gpu_memory(client, vm, space.address, data)?;
            }
            return Ok(());
        }

        if selector.is_all() {
            return self.for_each_vm(state, client, space.address, |vm| {
                self.write_gpu_memory(client, vm, space.address, data)
            });
        }

        let id = self.single_thread(selector)?;
        let Some(vm) = state.threads.get(&id).and_then(|thread| thread.memory_handle()) else {
            return Err(DebugError::NotAvailable(format!(
                "thread {} is not stopped under a vm",
                id
            )));
        };
        self.write_gpu_memory(client, vm, space.address, data)
    }

    fn validate_memory_access(
        &self,
        state: &SessionState,
        selector: ThreadSelector,
        space: &MemorySpace,
    ) -> Result<()> {
        if !is_valid_gpu_address(space.address) {
            return Err(DebugError::InvalidArgument(format!(
                "{:#x} is not a canonical gpu address",
                space.address
            )));
        }
        if selector.is_all() {
            if space.kind != MemoryKind::Default {
                return Err(DebugError::InvalidArgument(
                    "only the default address space spans all threads".to_string(),
                ));
            }
            return Ok(());
        }
        if selector.is_single() {
            if space.kind != MemoryKind::Default {
                return Err(DebugError::UnsupportedFeature(format!(
                    "{:?} memory access is not implemented",
                    space.kind
                )));
            }
            let id = self.single_thread(selector)?;
            return self.require_stopped(state, id);
        }
        Err(DebugError::InvalidArgument(format!(
            "{} must name one thread or all threads",
            selector
        )))
    }

    /// Per-tile VM handles of the ISA allocations containing the access.
    /// Empty when the address is no ISA at all.
    fn isa_vm_handles(
        &self,
        state: &SessionState,
        client: u64,
        address: u64,
        size: u64,
    ) -> Result<Vec<u64>> {
        let Some(conn) = state.connections.get(&client) else {
            return Ok(Vec::new());
        };
        let mut handles = Vec::new();
        for tile in 0..MAX_TILES {
            match conn.find_isa(tile, address, size) {
                IsaLookup::Hit(isa) => handles.push(isa.vm_handle),
                IsaLookup::CrossesBoundary => {
                    return Err(DebugError::InvalidArgument(format!(
                        "access at {:#x} crosses an isa allocation boundary",
                        address
                    )));
                }
                IsaLookup::Miss => {}
            }
        }
        Ok(handles)
    }

    /// Runs an access against every known VM until one accepts it. Used
    /// for all-threads accesses, where no single VM is implied.
    fn for_each_vm<F>(
        &self,
        state: &SessionState,
        client: u64,
        address: u64,
        mut access: F,
    ) -> Result<()>
    where
        F: FnMut(u64) -> Result<()>,
    {
        let vms: Vec<u64> = state
            .connections
            .get(&client)
            .map(|conn| conn.vm_ids.iter().copied().collect())
            .unwrap_or_default();
        if vms.is_empty() {
            return Err(DebugError::Uninitialized(
                "no target memory is mapped yet".to_string(),
            ));
        }
        for vm in vms {
            if access(vm).is_ok() {
                return Ok(());
            }
        }
        Err(DebugError::NotAvailable(format!(
            "address {:#x} is not mapped in any vm",
            address
        )))
    }

    // -- GPU memory transfer ------------------------------------------------

    fn read_gpu_memory(&self, client: u64, vm: u64, address: u64, buf: &mut [u8]) -> Result<()> {
        let fd = self
            .fd
            .open_vm(client, vm, uapi::VM_OPEN_READ_ONLY)
            .map_err(|err| {
                log::error!("opening vm {:#x} for reading: {}", vm, err);
                DebugError::Unknown(format!("vm open failed: {}", err))
            })?;
        let address = decanonize(address);

        if self.config.mmap_access {
            return fd.mmap_read(buf, address).map_err(|err| {
                log::error!("mapped read of {} bytes at {:#x}: {}", buf.len(), address, err);
                DebugError::Unknown(format!("gpu memory read failed: {}", err))
            });
        }

        let total = buf.len();
        let done = drive_transfer(total, |done| fd.pread(&mut buf[done..], address + done as u64))
            .map_err(|err| {
                log::error!("read of {} bytes at {:#x}: {}", total, address, err);
                DebugError::Unknown(format!("gpu memory read failed: {}", err))
            })?;
        if done != total {
            return Err(DebugError::Unknown(format!(
                "gpu memory read stalled at {} of {} bytes",
                done, total
            )));
        }
        Ok(())
    }

    fn write_gpu_memory(&self, client: u64, vm: u64, address: u64, data: &[u8]) -> Result<()> {
        let fd = self
            .fd
            .open_vm(client, vm, uapi::VM_OPEN_READ_WRITE)
            .map_err(|err| {
                log::error!("opening vm {:#x} for writing: {}", vm, err);
                DebugError::Unknown(format!("vm open failed: {}", err))
            })?;
        let address = decanonize(address);

        if self.config.mmap_access {
            return fd.mmap_write(data, address).map_err(|err| {
                log::error!(
                    "mapped write of {} bytes at {:#x}: {}",
                    data.len(),
                    address,
                    err
                );
                DebugError::Unknown(format!("gpu memory write failed: {}", err))
            });
        }

        let total = data.len();
        let done = drive_transfer(total, |done| fd.pwrite(&data[done..], address + done as u64))
            .map_err(|err| {
                log::error!("write of {} bytes at {:#x}: {}", total, address, err);
                DebugError::Unknown(format!("gpu memory write failed: {}", err))
            })?;
        if done != total {
            return Err(DebugError::Unknown(format!(
                "gpu memory write stalled at {} of {} bytes",
                done, total
            )));
        }
        Ok(())
    }
}

/// Canonical or already-decanonized addresses are acceptable; anything
/// with stray upper bits is not.
fn is_valid_gpu_address(address: u64) -> bool {
    address == decanonize(address) || address == canonize(address)
}

/// Little-endian dword `index` of a register image, zero when out of range.
fn dword(bytes: &[u8], index: usize) -> u32 {
    bytes
        .get(index * 4..index * 4 + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

fn set_dword(bytes: &mut [u8], index: usize, value: u32) {
    if let Some(slot) = bytes.get_mut(index * 4..index * 4 + 4) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
}

/// Drives a positioned transfer to completion. The kernel may report
/// partial progress; three consecutive empty transfers at the same
/// position abort.
fn drive_transfer<F>(total: usize, mut op: F) -> std::io::Result<usize>
where
    F: FnMut(usize) -> std::io::Result<usize>,
{
    let mut done = 0;
    let mut retries = 0u8;
    let mut last_pending = total;
    while done < total {
        match op(done)? {
            0 => {
                let pending = total - done;
                if pending < last_pending {
                    retries = 0;
                }
                last_pending = pending;
                retries += 1;
                if retries >= 3 {
                    break;
                }
            }
            n => done += n,
        }
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::testutil::{install_client, session_with_mock};
    use super::super::DebugSession;
    use super::*;
    use crate::config::Config;
    use crate::connection::{BindInfo, IsaAllocation};
    use crate::fd::{DebugFd, MockDebugFd, MockVmMemory, VmFd};
    use crate::state_save::{build_header, DEBUG_AREA_MAGIC, DEBUG_AREA_SHARED, SBA_AREA_MAGIC};
    use crate::threads::ALL;
    use crate::topology::{DeviceInfo, DeviceTopology};

    const CLIENT: u64 = 1;
    const VM: u64 = 5;
    const SAVE_BASE: u64 = 0x80_0000;
    const SAVE_LEN: usize = 16 * 1024;
    const SBA_OFFSET: u64 = 0x3000;

    fn fixture_header(version_major: u32) -> StateSaveAreaHeader {
        build_header(version_major, 2, 4, 8, 7)
    }

    /// Save area image with idents planted for the given threads.
    fn save_area_bytes(header: &StateSaveAreaHeader, threads: &[(ThreadId, u32)]) -> Vec<u8> {
        let mut data = vec![0u8; SAVE_LEN];
        let encoded = uapi::encode(header);
        data[..encoded.len()].copy_from_slice(&encoded);
        for &(id, count) in threads {
            let ident = SrIdent {
                magic: SR_IDENT_MAGIC,
                version: 2,
                count,
            };
            let at = header.sr_ident_offset(id) as usize;
            data[at..at + SrIdent::SIZE].copy_from_slice(&uapi::encode(&ident));
        }
        data
    }

    fn bind_save_area(session: &DebugSession) {
        let mut state = session.core.lock_state();
        let conn = state.connections.get_mut(&CLIENT).unwrap();
        conn.vm_ids.insert(VM);
        conn.vm_to_context_save_area.insert(
            VM,
            BindInfo {
                gpu_va: SAVE_BASE,
                size: SAVE_LEN as u64,
            },
        );
    }

    fn stop_thread(session: &DebugSession, id: ThreadId, counter: u32) {
        let mut state = session.core.lock_state();
        let thread = state.thread(id);
        assert!(thread.verify_stopped(counter));
        thread.stop(VM);
    }

    /// Session with thread s0.ss0.eu0.th0 stopped inside a mock save area.
    /// The area records save-area generation 3 against the thread's 1, so
    /// resume verification settles on the first poll.
    fn stopped_session(
        version_major: u32,
    ) -> (DebugSession, Arc<MockDebugFd>, Arc<MockVmMemory>, ThreadId) {
        let (session, fd) = session_with_mock(1);
        install_client(&session, CLIENT);
        let header = fixture_header(version_major);
        let id = ThreadId::new(0, 0, 0, 0, 0);
        let memory = fd.add_vm(VM, SAVE_BASE, save_area_bytes(&header, &[(id, 3)]));
        bind_save_area(&session);
        stop_thread(&session, id, 1);
        (session, fd, memory, id)
    }

    #[test]
    fn interrupt_wave_settles_to_unavailable_on_timeout() {
        let fd = Arc::new(MockDebugFd::new());
        let device = DeviceInfo::new(DeviceTopology::uniform(1, 2, 4, 8, 7));
        let mut config = Config::new(0x1234);
        config.interrupt_timeout = Duration::ZERO;
        let core = SessionCore::new(config, device, fd.clone() as Arc<dyn DebugFd>, None);
        let session = DebugSession { core, tile: None };
        install_client(&session, CLIENT);

        session.interrupt(ThreadSelector::all()).unwrap();
        session.core.send_interrupts();

        let calls = fd.eu_control_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].cmd, uapi::EU_CONTROL_CMD_INTERRUPT_ALL);
        assert_eq!(calls[0].engine, (uapi::ENGINE_CLASS_COMPUTE, 0));
        assert!(calls[0].bitmask.is_empty());
        {
            let state = session.core.lock_state();
            assert!(state.interrupt_sent);
            assert_eq!(state.eu_control_seqno[0], 10);
        }
        assert!(matches!(
            session.interrupt(ThreadSelector::all()),
            Err(DebugError::NotReady)
        ));

        std::thread::sleep(Duration::from_millis(2));
        session.core.generate_events_and_resume_stopped_threads();
        let event = session.read_event(Some(Duration::from_millis(5))).unwrap();
        assert!(matches!(event, ApiEvent::ThreadUnavailable { thread } if thread.is_all()));
        let state = session.core.lock_state();
        assert!(!state.interrupt_sent);
        assert!(state.pending_interrupts.is_empty());
    }

    #[test]
    fn failed_interrupt_reports_unavailable_immediately() {
        let (session, fd) = session_with_mock(1);
        install_client(&session, CLIENT);
        fd.fail_eu_control(libc::EIO);

        let selector = ThreadSelector::single(0, 1, 2, 3);
        session.interrupt(selector).unwrap();
        session.core.send_interrupts();

        {
            let state = session.core.lock_state();
            assert!(!state.interrupt_sent);
            assert!(state.pending_interrupts.is_empty());
            assert_eq!(state.eu_control_seqno[0], INVALID_HANDLE);
        }
        let event = session.read_event(Some(Duration::from_millis(5))).unwrap();
        assert!(matches!(event, ApiEvent::ThreadUnavailable { thread } if thread == selector));
    }

    #[test]
    fn interrupting_stopped_threads_is_rejected() {
        let (session, _fd, _memory, _id) = stopped_session(2);
        let result = session.interrupt(ThreadSelector::single(0, 0, 0, 0));
        assert!(matches!(result, Err(DebugError::NotAvailable(_))));
    }

    #[test]
    fn resume_writes_sip_command_and_clears_stop() {
        let (session, fd, memory, id) = stopped_session(2);
        let selector = ThreadSelector::single(0, 0, 0, 0);
        session.resume(selector).unwrap();

        let header = fixture_header(2);
        let at = (header.thread_slot_offset(id) + u64::from(header.regs.cmd.offset)) as usize;
        assert_eq!(&memory.bytes()[at..at + 4], &SIP_COMMAND_RESUME.to_le_bytes());

        let calls = fd.eu_control_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].cmd, uapi::EU_CONTROL_CMD_RESUME);
        assert!(calls[0].bitmask.iter().any(|byte| *byte != 0));
        {
            let state = session.core.lock_state();
            assert!(!state.threads.get(&id).unwrap().is_stopped());
        }
        assert!(matches!(
            session.resume(selector),
            Err(DebugError::NotAvailable(_))
        ));
    }

    #[test]
    fn legacy_resume_sets_register_bit() {
        let fd = Arc::new(MockDebugFd::new());
        let mut device = DeviceInfo::new(DeviceTopology::uniform(1, 2, 4, 8, 7));
        device.resume_wa = true;
        let core = SessionCore::new(
            Config::new(0x1234),
            device,
            fd.clone() as Arc<dyn DebugFd>,
            None,
        );
        let session = DebugSession { core, tile: None };
        install_client(&session, CLIENT);

        let header = fixture_header(1);
        let id = ThreadId::new(0, 0, 0, 0, 0);
        let memory = fd.add_vm(VM, SAVE_BASE, save_area_bytes(&header, &[(id, 3)]));
        bind_save_area(&session);
        stop_thread(&session, id, 1);

        session.resume(ThreadSelector::single(0, 0, 0, 0)).unwrap();
        let slot = header.thread_slot_offset(id) as usize;
        let r0_dword4 = slot + 16;
        let bytes = memory.bytes();
        assert_eq!(
            u32::from_le_bytes(bytes[r0_dword4..r0_dword4 + 4].try_into().unwrap()),
            LEGACY_SIP_RESUME_BIT
        );

        // A shared debug area moves the request bit into CR0.
        {
            let mut state = session.core.lock_state();
            state.debug_area = Some(DebugAreaHeader {
                magic: DEBUG_AREA_MAGIC,
                reserved1: 0,
                version: 1,
                flags: DEBUG_AREA_SHARED,
            });
        }
        stop_thread(&session, id, 5);
        session.resume(ThreadSelector::single(0, 0, 0, 0)).unwrap();
        let cr_dword1 = slot + header.regs.cr.offset as usize + 4;
        let bytes = memory.bytes();
        assert_eq!(
            u32::from_le_bytes(bytes[cr_dword1..cr_dword1 + 4].try_into().unwrap()),
            LEGACY_SIP_RESUME_BIT
        );
    }

    #[test]
    fn register_access_requires_single_stopped_thread() {
        let (session, _fd, _memory, _id) = stopped_session(2);
        assert!(matches!(
            session.read_registers(ThreadSelector::all(), RegsetType::Grf, 0, 1),
            Err(DebugError::NotAvailable(_))
        ));
        assert!(matches!(
            session.read_registers(ThreadSelector::single(0, 0, 0, 1), RegsetType::Grf, 0, 1),
            Err(DebugError::NotAvailable(_))
        ));
        assert!(matches!(
            session.read_registers(ThreadSelector::single(0, 0, 0, 0), RegsetType::Grf, 128, 1),
            Err(DebugError::InvalidArgument(_))
        ));
        assert!(matches!(
            session.write_registers(ThreadSelector::single(0, 0, 0, 0), RegsetType::Ce, 0, &[0; 4]),
            Err(DebugError::InvalidArgument(_))
        ));
        assert!(matches!(
            session.write_registers(ThreadSelector::single(0, 0, 0, 0), RegsetType::Grf, 0, &[0; 7]),
            Err(DebugError::InvalidArgument(_))
        ));
    }

    #[test]
    fn grf_roundtrip_lands_in_the_save_area_slot() {
        let (session, _fd, memory, id) = stopped_session(2);
        let selector = ThreadSelector::single(0, 0, 0, 0);
        let values: Vec<u8> = (0..64).map(|i| i as u8).collect();
        session
            .write_registers(selector, RegsetType::Grf, 2, &values)
            .unwrap();
        let read = session
            .read_registers(selector, RegsetType::Grf, 2, 2)
            .unwrap();
        assert_eq!(read, values);

        let header = fixture_header(2);
        let at = (header.thread_slot_offset(id) + 2 * 32) as usize;
        assert_eq!(&memory.bytes()[at..at + 64], &values[..]);
    }

    #[test]
    fn sba_registers_synthesize_binding_table_and_scratch() {
        let (session, fd, _memory, _id) = stopped_session(2);
        {
            let mut state = session.core.lock_state();
            let conn = state.connections.get_mut(&CLIENT).unwrap();
            conn.vm_to_sba.insert(
                VM,
                BindInfo {
                    gpu_va: SAVE_BASE + SBA_OFFSET,
                    size: SbaTrackedAddresses::SIZE as u64,
                },
            );
        }
        let sba = SbaTrackedAddresses {
            magic: SBA_AREA_MAGIC,
            reserved1: 0,
            version: 1,
            reserved2: 0,
            general_state_base: 0x1000,
            surface_state_base: 0x2000,
            dynamic_state_base: 0x3000,
            indirect_object_base: 0x4000,
            instruction_base: 0x5000,
            bindless_surface_state_base: 0x6000,
            bindless_sampler_state_base: 0x7000,
        };
        let vm_fd = fd.open_vm(CLIENT, VM, uapi::VM_OPEN_READ_WRITE).unwrap();
        vm_fd
            .pwrite(&uapi::encode(&sba), SAVE_BASE + SBA_OFFSET)
            .unwrap();

        // r0.4 carries the binding table pointer, r0.5 the scratch pointer.
        let selector = ThreadSelector::single(0, 0, 0, 0);
        let mut r0 = vec![0u8; 32];
        r0[16..20].copy_from_slice(&0x10ffu32.to_le_bytes());
        r0[20..24].copy_from_slice(&0x8c00u32.to_le_bytes());
        session
            .write_registers(selector, RegsetType::Grf, 0, &r0)
            .unwrap();

        let bytes = session
            .read_registers(selector, RegsetType::Sba, 0, 9)
            .unwrap();
        let value =
            |index: usize| u64::from_le_bytes(bytes[index * 8..index * 8 + 8].try_into().unwrap());
        assert_eq!(value(0), 0x1000);
        assert_eq!(value(4), 0x5000);
        assert_eq!(value(7), 0x10e0 + 0x2000);
        assert_eq!(value(8), 0x8c00 + 0x1000);

        let tail = session
            .read_registers(selector, RegsetType::Sba, 7, 2)
            .unwrap();
        assert_eq!(
            u64::from_le_bytes(tail[..8].try_into().unwrap()),
            0x10e0 + 0x2000
        );
        assert!(matches!(
            session.read_registers(selector, RegsetType::Sba, 8, 2),
            Err(DebugError::InvalidArgument(_))
        ));
    }

    #[test]
    fn memory_access_validates_selector_and_address() {
        let (session, _fd, _memory, _id) = stopped_session(2);
        let mut buf = [0u8; 4];
        assert!(matches!(
            session.read_memory(
                ThreadSelector::all(),
                &MemorySpace::at(0x00ff_0000_0000_1000),
                &mut buf
            ),
            Err(DebugError::InvalidArgument(_))
        ));
        let slm = MemorySpace {
            address: 0x1000,
            kind: MemoryKind::Slm,
        };
        assert!(matches!(
            session.read_memory(ThreadSelector::all(), &slm, &mut buf),
            Err(DebugError::InvalidArgument(_))
        ));
        assert!(matches!(
            session.read_memory(ThreadSelector::single(0, 0, 0, 0), &slm, &mut buf),
            Err(DebugError::UnsupportedFeature(_))
        ));
        let partial = ThreadSelector {
            slice: 0,
            subslice: ALL,
            eu: ALL,
            thread: ALL,
        };
        assert!(matches!(
            session.read_memory(partial, &MemorySpace::at(0x1000), &mut buf),
            Err(DebugError::InvalidArgument(_))
        ));

        let (bare, _fd) = session_with_mock(1);
        assert!(matches!(
            bare.read_memory(ThreadSelector::all(), &MemorySpace::at(0x1000), &mut buf),
            Err(DebugError::Uninitialized(_))
        ));
    }

    #[test]
    fn all_threads_access_probes_every_vm() {
        let (session, fd) = session_with_mock(1);
        install_client(&session, CLIENT);
        {
            let mut state = session.core.lock_state();
            let conn = state.connections.get_mut(&CLIENT).unwrap();
            conn.vm_ids.insert(11);
            conn.vm_ids.insert(12);
        }
        // Only vm 12 is backed; the probe must get past vm 11.
        let memory = fd.add_vm(12, 0x2000, vec![0xab; 64]);

        let mut buf = [0u8; 8];
        session
            .read_memory(ThreadSelector::all(), &MemorySpace::at(0x2000), &mut buf)
            .unwrap();
        assert_eq!(buf, [0xab; 8]);

        session
            .write_memory(ThreadSelector::all(), &MemorySpace::at(0x2010), &[1, 2, 3])
            .unwrap();
        assert_eq!(&memory.bytes()[0x10..0x13], &[1, 2, 3]);

        memory.stall_reads(3);
        assert!(matches!(
            session.read_memory(ThreadSelector::all(), &MemorySpace::at(0x2000), &mut buf),
            Err(DebugError::NotAvailable(_))
        ));
    }

    #[test]
    fn partial_progress_reads_complete() {
        let (session, _fd, memory, _id) = stopped_session(2);
        let selector = ThreadSelector::single(0, 0, 0, 0);
        memory.limit_chunk(5);
        let mut buf = [0u8; 16];
        session
            .read_memory(selector, &MemorySpace::at(SAVE_BASE), &mut buf)
            .unwrap();
        assert_eq!(&buf[..8], &STATE_SAVE_MAGIC);

        memory.stall_reads(2);
        let mut rest = [0u8; 4];
        session
            .read_memory(selector, &MemorySpace::at(SAVE_BASE), &mut rest)
            .unwrap();
    }

    #[test]
    fn isa_accesses_route_to_every_tile_instance() {
        let (session, fd) = session_with_mock(1);
        install_client(&session, CLIENT);
        let isa_va = 0x345000u64;
        {
            let mut state = session.core.lock_state();
            let conn = state.connections.get_mut(&CLIENT).unwrap();
            for (tile, vm) in [(0, 21u64), (1, 22u64)] {
                conn.isa_map[tile].insert(
                    isa_va,
                    IsaAllocation {
                        bind_info: BindInfo {
                            gpu_va: isa_va,
                            size: 0x2000,
                        },
                        vm_handle: vm,
                        tile_instanced: true,
                        ..Default::default()
                    },
                );
            }
        }
        let first = fd.add_vm(21, isa_va, vec![0; 0x2000]);
        let second = fd.add_vm(22, isa_va, vec![0; 0x2000]);

        session
            .write_memory(
                ThreadSelector::all(),
                &MemorySpace::at(isa_va + 0x10),
                &[7, 8],
            )
            .unwrap();
        assert_eq!(&first.bytes()[0x10..0x12], &[7, 8]);
        assert_eq!(&second.bytes()[0x10..0x12], &[7, 8]);

        let mut buf = [0u8; 2];
        session
            .read_memory(
                ThreadSelector::all(),
                &MemorySpace::at(isa_va + 0x10),
                &mut buf,
            )
            .unwrap();
        assert_eq!(buf, [7, 8]);

        let mut over = [0u8; 16];
        assert!(matches!(
            session.read_memory(
                ThreadSelector::all(),
                &MemorySpace::at(isa_va + 0x2000 - 8),
                &mut over
            ),
            Err(DebugError::InvalidArgument(_))
        ));
    }

    #[test]
    fn module_image_reads_come_from_the_elf_copy() {
        let (session, _fd) = session_with_mock(1);
        install_client(&session, CLIENT);
        let elf_va = 0x70_0000u64;
        let payload: Vec<u8> = (0..64).map(|i| i as u8).collect();
        {
            let mut state = session.core.lock_state();
            let conn = state.connections.get_mut(&CLIENT).unwrap();
            conn.uuids.insert(
                33,
                crate::connection::UuidData {
                    handle: 33,
                    payload: payload.clone(),
                    ..Default::default()
                },
            );
            conn.elf_map.insert(elf_va, 33);
        }

        let mut buf = [0u8; 3];
        session
            .read_memory(ThreadSelector::all(), &MemorySpace::at(elf_va + 2), &mut buf)
            .unwrap();
        assert_eq!(buf, [2, 3, 4]);

        let mut over = [0u8; 8];
        assert!(matches!(
            session.read_memory(
                ThreadSelector::all(),
                &MemorySpace::at(elf_va + 60),
                &mut over
            ),
            Err(DebugError::InvalidArgument(_))
        ));
    }

    #[test]
    fn module_debug_area_magic_is_checked() {
        let (session, fd) = session_with_mock(1);
        install_client(&session, CLIENT);
        let area = DebugAreaHeader {
            magic: DEBUG_AREA_MAGIC,
            reserved1: 0,
            version: 2,
            flags: DEBUG_AREA_SHARED,
        };
        let mut data = vec![0u8; 64];
        data[..DebugAreaHeader::SIZE].copy_from_slice(&uapi::encode(&area));
        fd.add_vm(7, 0x40_0000, data);
        {
            let mut state = session.core.lock_state();
            let conn = state.connections.get_mut(&CLIENT).unwrap();
            conn.vm_to_module_debug_area.insert(
                7,
                BindInfo {
                    gpu_va: 0x40_0000,
                    size: 64,
                },
            );
        }

        session.core.read_module_debug_area().unwrap();
        {
            let state = session.core.lock_state();
            assert!(state.debug_area.map(|a| a.is_shared()).unwrap_or(false));
        }

        let vm_fd = fd.open_vm(CLIENT, 7, uapi::VM_OPEN_READ_WRITE).unwrap();
        vm_fd.pwrite(b"mangled!", 0x40_0000).unwrap();
        assert!(session.core.read_module_debug_area().is_err());
    }

    #[test]
    fn attention_triage_resumes_accidental_stops_quietly() {
        let (session, fd) = session_with_mock(1);
        install_client(&session, CLIENT);
        let header = fixture_header(2);
        let accidental = ThreadId::new(0, 0, 0, 0, 0);
        let faulted = ThreadId::new(0, 0, 0, 0, 1);
        let mut data = save_area_bytes(&header, &[(accidental, 3), (faulted, 3)]);
        let cr1 =
            (header.thread_slot_offset(faulted) + u64::from(header.regs.cr.offset)) as usize + 4;
        data[cr1..cr1 + 4].copy_from_slice(&0x8000_0000u32.to_le_bytes());
        fd.add_vm(VM, SAVE_BASE, data);
        bind_save_area(&session);
        stop_thread(&session, accidental, 1);
        stop_thread(&session, faulted, 1);
        {
            let mut state = session.core.lock_state();
            state.newly_stopped = vec![accidental, faulted];
            state.trigger_events = true;
        }

        session.core.generate_events_and_resume_stopped_threads();

        let event = session.read_event(Some(Duration::from_millis(5))).unwrap();
        assert!(matches!(
            event,
            ApiEvent::ThreadStopped { thread } if thread == ThreadSelector::single(0, 0, 0, 1)
        ));
        {
            let state = session.core.lock_state();
            assert!(!state.threads.get(&accidental).unwrap().is_stopped());
            assert!(state.threads.get(&faulted).unwrap().is_stopped());
            assert!(state.newly_stopped.is_empty());
            assert!(!state.trigger_events);
        }

        let resumes: Vec<_> = fd
            .eu_control_calls()
            .into_iter()
            .filter(|call| call.cmd == uapi::EU_CONTROL_CMD_RESUME)
            .collect();
        assert_eq!(resumes.len(), 1);
    }

    #[test]
    fn register_set_properties_need_the_save_area() {
        let (session, _fd) = session_with_mock(1);
        install_client(&session, CLIENT);
        assert!(matches!(
            session.register_set_properties(),
            Err(DebugError::Uninitialized(_))
        ));

        let (session, _fd, _memory, _id) = stopped_session(2);
        let sets = session.register_set_properties().unwrap();
        assert!(sets.iter().any(|set| set.kind == RegsetType::Grf));
        assert!(sets
            .iter()
            .all(|set| set.kind != RegsetType::Sba || !set.writeable));
    }
}
