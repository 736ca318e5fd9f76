//! Kernel event handling.
//!
//! The worker thread decodes raw records off the internal queue and folds
//! them into session bookkeeping:
//!
//! - CLIENT/CONTEXT/VM/ENGINES events maintain the handle maps
//! - UUID registrations classify allocations and announce command queues
//! - VM binds track metadata areas, ISA allocations and zebin segments,
//!   producing module load/unload events
//! - EU attention marks threads stopped and feeds interrupt bookkeeping

use super::{SessionCore, SessionState};
use crate::connection::{
    canonize, class_from_hash, decanonize, va_from_uuid_string, BindInfo, ClientConnection,
    CommandQueueNotification, IsaAllocation, ModuleEntry, UuidClass, UuidData,
    COMMAND_QUEUE_UUID_HASH, MAX_TILES,
};
use crate::error::{DebugError, Result};
use crate::events::{self, ApiEvent, ContextParamValue, Engine, KernelEvent};
use crate::fd::UuidInfo;
use crate::threads::ThreadId;
use crate::uapi;

impl SessionCore {
    /// Decodes and dispatches one raw kernel record.
    pub(super) fn handle_raw_event(&self, bytes: &[u8]) {
        let Some(event) = events::decode(bytes) else {
            return;
        };
        const KNOWN: u32 = uapi::FLAG_CREATE | uapi::FLAG_DESTROY | uapi::FLAG_STATE_CHANGE;
        if event.flags() & KNOWN == 0 {
            log::warn!(
                "kernel event type {} carries unsupported flags {:#x}",
                event.kind(),
                event.flags()
            );
            return;
        }
        self.handle_event(&event);
    }

    fn handle_event(&self, event: &KernelEvent) {
        log::debug!(
            "kernel event type {} flags {:#x} seqno {}",
            event.kind(),
            event.flags(),
            event.seqno()
        );
        match event {
            KernelEvent::Client { handle, .. } => {
                self.handle_client_event(*handle, event.is_create(), event.is_destroy())
            }
            KernelEvent::Context {
                client_handle,
                handle,
                ..
            } => self.handle_context_event(
                *client_handle,
                *handle,
                event.is_create(),
                event.is_destroy(),
            ),
            KernelEvent::Uuid { .. } => self.handle_uuid_event(event),
            KernelEvent::Vm {
                client_handle,
                handle,
                ..
            } => {
                self.handle_vm_event(*client_handle, *handle, event.is_create(), event.is_destroy())
            }
            KernelEvent::VmBind { .. } => self.handle_vm_bind_event(event),
            KernelEvent::ContextParam {
                client_handle,
                ctx_handle,
                param,
                ..
            } => self.handle_context_param_event(*client_handle, *ctx_handle, param),
            KernelEvent::EuAttention { .. } => self.handle_attention_event(event),
            KernelEvent::Engines {
                client_handle,
                ctx_handle,
                engines,
                ..
            } => self.handle_engines_event(
                *client_handle,
                *ctx_handle,
                engines,
                event.is_create(),
                event.is_destroy(),
            ),
        }
    }

    fn handle_client_event(&self, handle: u64, create: bool, destroy: bool) {
        let mut state = self.lock_state();
        if create {
            if state.connections.contains_key(&handle) {
                log::error!("client {:#x} registered twice, session is poisoned", handle);
                state.poisoned = true;
                return;
            }
            log::info!("client {:#x} connected", handle);
            state
                .connections
                .insert(handle, ClientConnection::new(handle));
        }
        if destroy {
            log::info!("client {:#x} closed", handle);
            state.client_close_seen = Some(handle);
            if state.client_handle == Some(handle) {
                state.device_lost = true;
            }
        }
    }

    fn handle_context_event(&self, client: u64, handle: u64, create: bool, destroy: bool) {
        let mut state = self.lock_state();
        let Some(conn) = state.connections.get_mut(&client) else {
            log::warn!("context event for unknown client {:#x}", client);
            return;
        };
        if create {
            conn.contexts.entry(handle).or_default();
        }
        if destroy {
            conn.contexts.remove(&handle);
        }
    }

    fn handle_vm_event(&self, client: u64, handle: u64, create: bool, destroy: bool) {
        let mut state = self.lock_state();
        let Some(conn) = state.connections.get_mut(&client) else {
            log::warn!("vm event for unknown client {:#x}", client);
            return;
        };
        if create {
            conn.vm_ids.insert(handle);
        }
        if destroy {
            conn.vm_ids.remove(&handle);
        }
    }

    fn handle_context_param_event(&self, client: u64, ctx: u64, param: &ContextParamValue) {
        let mut state = self.lock_state();
        let Some(conn) = state.connections.get_mut(&client) else {
            log::warn!("context param for unknown client {:#x}", client);
            return;
        };
        if !conn.contexts.contains_key(&ctx) {
            log::error!("context param for unknown context {:#x}", ctx);
            return;
        }
        match param {
            ContextParamValue::Vm(vm) => {
                log::debug!("context {:#x} runs on vm {:#x}", ctx, vm);
                if let Some(info) = conn.contexts.get_mut(&ctx) {
                    info.vm = Some(*vm);
                }
            }
            ContextParamValue::Engines(engines) => {
                if let Some(info) = conn.contexts.get_mut(&ctx) {
                    info.engines = engines.clone();
                }
                if let Some(&(_, instance)) = engines.first() {
                    let tile = self.tile_of_engine_instance(instance);
                    if let Some(vm) = conn.contexts.get(&ctx).and_then(|c| c.vm) {
                        conn.vm_to_tile.insert(vm, tile);
                    }
                }
            }
            ContextParamValue::Other(id) => {
                log::info!("unhandled context param {:#x} for context {:#x}", id, ctx);
            }
        }
    }

    fn handle_engines_event(
        &self,
        client: u64,
        ctx: u64,
        engines: &[Engine],
        create: bool,
        destroy: bool,
    ) {
        let mut state = self.lock_state();
        let Some(conn) = state.connections.get_mut(&client) else {
            log::warn!("engines event for unknown client {:#x}", client);
            return;
        };
        for engine in engines {
            if create {
                conn.lrc_to_context.insert(engine.lrc_handle, ctx);
            }
            if destroy {
                conn.lrc_to_context.remove(&engine.lrc_handle);
            }
        }
    }

    // -- UUID registration --------------------------------------------------

    fn handle_uuid_event(&self, event: &KernelEvent) {
        let KernelEvent::Uuid {
            client_handle,
            handle,
            class_handle,
            payload_size,
            ..
        } = *event
        else {
            return;
        };

        if event.is_destroy() {
            self.handle_uuid_destroy(client_handle, handle);
            return;
        }
        if !event.is_create() {
            return;
        }

        if payload_size == 0 {
            let mut state = self.lock_state();
            if let Some(conn) = state.connections.get_mut(&client_handle) {
                conn.uuids.insert(
                    handle,
                    UuidData {
                        handle,
                        class_handle,
                        ..Default::default()
                    },
                );
            }
            return;
        }

        let info = match self.fd.read_uuid(client_handle, handle, payload_size) {
            Ok(info) => info,
            Err(err) => {
                log::error!("uuid {:#x} read failed: {}", handle, err);
                return;
            }
        };

        let mut state = self.lock_state();
        self.register_uuid(&mut state, client_handle, handle, class_handle, info);
    }

    fn handle_uuid_destroy(&self, client: u64, handle: u64) {
        let mut state = self.lock_state();
        if let Some(conn) = state.connections.get_mut(&client) {
            if conn.uuids.get(&handle).and_then(|u| u.class) == Some(UuidClass::ZebinModule) {
                conn.modules.remove(&handle);
            }
        }
        if state.client_handle == Some(client) && state.command_queues.remove(&handle).is_some() {
            log::debug!("command queue uuid {:#x} destroyed", handle);
            if state.command_queues.is_empty() {
                log::info!("last command queue destroyed, reporting process exit");
                self.broadcast_api_event(&mut state, ApiEvent::ProcessExit);
            }
        }
    }

    fn register_uuid(
        &self,
        state: &mut SessionState,
        client: u64,
        handle: u64,
        class_handle: u64,
        info: UuidInfo,
    ) {
        log::debug!("uuid {:#x} registered as {}", handle, info.uuid);

        if info.uuid == COMMAND_QUEUE_UUID_HASH
            && (state.client_handle.is_none() || state.client_handle == Some(client))
        {
            state.client_handle = Some(client);

            let device_index = CommandQueueNotification::decode(&info.payload)
                .map(|n| n.subdevice_index)
                .unwrap_or(0);
            if state.command_queues.is_empty() {
                log::info!("first command queue created, reporting process entry");
                self.broadcast_api_event(state, ApiEvent::ProcessEntry);
            }
            state.command_queues.insert(handle, device_index);
        }

        if let Some(class) = class_from_hash(&info.uuid) {
            if state.client_handle.is_none() {
                state.client_handle = Some(client);
            }
            let name = String::from_utf8_lossy(&info.payload).into_owned();
            log::debug!("class uuid {:#x} declares {:?} ({})", handle, class, name);
            if let Some(conn) = state.connections.get_mut(&client) {
                conn.class_handles.insert(handle, (name, class));
            }
        } else {
            let Some(conn) = state.connections.get_mut(&client) else {
                log::warn!("uuid event for unknown client {:#x}", client);
                return;
            };
            let class = conn.class_handles.get(&class_handle).map(|&(_, c)| c);
            let mut data = UuidData {
                handle,
                class_handle,
                class,
                payload: info.payload,
                ptr: 0,
            };
            if class == Some(UuidClass::Elf) {
                data.ptr = va_from_uuid_string(&info.uuid);
            }
            if class == Some(UuidClass::ZebinModule) {
                conn.modules.insert(handle, ModuleEntry::default());
            }
            extract_uuid_data(conn, &data);
            conn.uuids.insert(handle, data);
        }
    }

    // -- VM bind ------------------------------------------------------------

    fn handle_vm_bind_event(&self, event: &KernelEvent) {
        let KernelEvent::VmBind {
            client_handle,
            vm_handle,
            va_start,
            va_length,
            ref uuids,
            ..
        } = *event
        else {
            return;
        };
        let create = event.is_create();
        let destroy = event.is_destroy();
        let needs_ack = event.needs_ack();
        let seqno = event.seqno();

        let mut should_ack = true;
        // Events queued while the connection borrow is live, flushed below.
        let mut pushes: Vec<(u32, ApiEvent, Option<uapi::EventAck>)> = Vec::new();

        let mut state = self.lock_state();
        let state = &mut *state;

        if !uuids.is_empty() {
            let Some(conn) = state.connections.get_mut(&client_handle) else {
                log::warn!("vm bind for unknown client {:#x}", client_handle);
                return;
            };
            let uuid0 = uuids[0];
            let Some(lead) = conn.uuids.get(&uuid0) else {
                log::error!("vm bind names unknown uuid {:#x}", uuid0);
                return;
            };
            let lead_class = lead.class;
            let lead_class_handle = lead.class_handle;
            let tile = (conn.vm_to_tile.get(&vm_handle).copied().unwrap_or(0) as usize)
                .min(MAX_TILES - 1);

            // Metadata areas announce themselves by binding with a class
            // definition UUID in front.
            if let Some(&(_, class)) = conn.class_handles.get(&lead_class_handle) {
                let info = BindInfo {
                    gpu_va: va_start,
                    size: va_length,
                };
                let slot = match class {
                    UuidClass::SbaTrackingBuffer => Some((&mut conn.vm_to_sba, conn.sba_gpu_va)),
                    UuidClass::ModuleDebugArea => Some((
                        &mut conn.vm_to_module_debug_area,
                        conn.module_debug_area_gpu_va,
                    )),
                    UuidClass::ContextSaveArea => Some((
                        &mut conn.vm_to_context_save_area,
                        conn.context_save_area_gpu_va,
                    )),
                    _ => None,
                };
                if let Some((map, announced)) = slot {
                    if announced != 0 && announced != va_start {
                        log::warn!(
                            "{:?} bound at {:#x}, announced at {:#x}",
                            class,
                            va_start,
                            announced
                        );
                    }
                    map.insert(vm_handle, info);
                }
            }

            if lead_class == Some(UuidClass::Isa) {
                let mut per_kernel = true;
                let mut module_uuid = None;
                let mut tile_instanced = false;
                for &u in &uuids[1..] {
                    let entry = conn.uuids.get(&u);
                    if entry.and_then(|e| e.class) == Some(UuidClass::ZebinModule) {
                        per_kernel = false;
                        module_uuid = Some(u);
                    }
                    if entry.map(|e| e.class_handle) == Some(uuid0) {
                        tile_instanced = true;
                    }
                }

                if create && !conn.isa_map[tile].contains_key(&va_start) {
                    let mut elf_handle = None;
                    for &u in &uuids[1..] {
                        if conn.uuids.get(&u).and_then(|e| e.class) == Some(UuidClass::Elf) {
                            elf_handle = Some(u);
                            if !per_kernel {
                                if let Some(module) =
                                    module_uuid.and_then(|m| conn.modules.get_mut(&m))
                                {
                                    module.elf_handle = Some(u);
                                }
                            }
                        }
                    }

                    let (module_begin, module_end) = match elf_handle {
                        Some(h) => {
                            let begin = conn.uuids.get(&h).map(|e| e.ptr).unwrap_or(0);
                            let size =
                                conn.uuids.get(&h).map(|e| e.payload.len() as u64).unwrap_or(0);
                            conn.elf_map.insert(begin, h);
                            (begin, begin + size)
                        }
                        None => {
                            log::error!("isa bind at {:#x} carries no elf image", va_start);
                            (0, 0)
                        }
                    };

                    let mut isa = IsaAllocation {
                        bind_info: BindInfo {
                            gpu_va: va_start,
                            size: va_length,
                        },
                        vm_handle,
                        elf_handle,
                        module_begin,
                        module_end,
                        tile_instanced,
                        per_kernel_module: per_kernel,
                        vm_bind_counter: 0,
                        ack_events: Vec::new(),
                        module_load_event_acked: false,
                    };
                    // Without the ack requirement there is nothing to hold
                    // back on behalf of the load event.
                    if !needs_ack {
                        isa.module_load_event_acked = true;
                    }
                    conn.isa_map[tile].insert(va_start, isa);
                    log::debug!(
                        "isa allocation at {:#x} on tile {}, per-kernel {}",
                        va_start,
                        tile,
                        per_kernel
                    );

                    if per_kernel {
                        pushes.push((
                            tile as u32,
                            ApiEvent::ModuleLoad {
                                load: canonize(va_start),
                                module_begin,
                                module_end,
                                needs_ack,
                            },
                            None,
                        ));
                        should_ack = false;
                    }
                }

                if create {
                    if let Some(isa) = conn.isa_map[tile].get_mut(&va_start) {
                        if !isa.module_load_event_acked && isa.per_kernel_module {
                            log::debug!("deferring vm bind ack, seqno {}", seqno);
                            isa.ack_events.push(uapi::EventAck {
                                kind: uapi::EVENT_VM_BIND,
                                flags: 0,
                                seqno,
                            });
                            should_ack = false;
                        }
                        isa.vm_bind_counter += 1;
                    }
                }

                if destroy {
                    let mut unbound = false;
                    if let Some(isa) = conn.isa_map[tile].get_mut(&va_start) {
                        if isa.vm_bind_counter > 0 {
                            isa.vm_bind_counter -= 1;
                            if isa.vm_bind_counter == 0 {
                                if isa.per_kernel_module {
                                    pushes.push((
                                        tile as u32,
                                        ApiEvent::ModuleUnload {
                                            load: canonize(isa.bind_info.gpu_va),
                                            module_begin: isa.module_begin,
                                            module_end: isa.module_end,
                                        },
                                        None,
                                    ));
                                }
                                unbound = true;
                            }
                        } else {
                            log::debug!("unbalanced vm unbind at {:#x}", va_start);
                        }
                    }
                    if unbound {
                        conn.isa_map[tile].remove(&va_start);
                    }
                }
            }

            // Zebin modules report load once all segments are bound and
            // unload once the last segment is gone.
            for &u in uuids {
                if conn.uuids.get(&u).and_then(|e| e.class) != Some(UuidClass::ZebinModule) {
                    continue;
                }
                let elf = conn.modules.get(&u).and_then(|m| m.elf_handle);
                let (module_begin, module_end) = match elf {
                    Some(h) => {
                        let begin = conn.uuids.get(&h).map(|e| e.ptr).unwrap_or(0);
                        let size =
                            conn.uuids.get(&h).map(|e| e.payload.len() as u64).unwrap_or(0);
                        (begin, begin + size)
                    }
                    None => (0, 0),
                };
                let Some(module) = conn.modules.get_mut(&u) else {
                    continue;
                };

                if create {
                    module.segment_vm_bind_counter[tile] += 1;
                    let before = module.load_addresses[tile].len() as u32;
                    module.load_addresses[tile].insert(va_start);
                    let after = module.load_addresses[tile].len() as u32;

                    if before + 1 == module.segment_count && after == module.segment_count {
                        let load =
                            canonize(module.min_load_address(tile).unwrap_or(va_start));
                        log::info!(
                            "zebin module loaded at {:#x} with {} segments",
                            load,
                            module.segment_count
                        );
                        let ack = needs_ack.then_some(uapi::EventAck {
                            kind: uapi::EVENT_VM_BIND,
                            flags: 0,
                            seqno,
                        });
                        pushes.push((
                            tile as u32,
                            ApiEvent::ModuleLoad {
                                load,
                                module_begin,
                                module_end,
                                needs_ack,
                            },
                            ack,
                        ));
                        should_ack = false;
                    }
                } else if destroy && module.segment_vm_bind_counter[tile] > 0 {
                    module.segment_vm_bind_counter[tile] -= 1;
                    if module.segment_vm_bind_counter[tile] == 0 {
                        let load =
                            canonize(module.min_load_address(tile).unwrap_or(va_start));
                        pushes.push((
                            tile as u32,
                            ApiEvent::ModuleUnload {
                                load,
                                module_begin,
                                module_end,
                            },
                            None,
                        ));
                        module.load_addresses[tile].clear();
                    }
                }
            }
        }

        for (tile, event, ack) in pushes {
            if let Some(ack) = ack {
                state.events_to_ack.push((event.clone(), ack));
            }
            self.push_api_event(state, Some(tile), event);
        }

        if should_ack && needs_ack {
            if let Err(err) = self.fd.ack_event(uapi::EVENT_VM_BIND, seqno) {
                log::error!("vm bind ack seqno {} failed: {}", seqno, err);
            }
        }
    }

    // -- attention ----------------------------------------------------------

    fn handle_attention_event(&self, event: &KernelEvent) {
        let KernelEvent::EuAttention {
            client_handle,
            lrc_handle,
            engine,
            ref bitmask,
            ..
        } = *event
        else {
            return;
        };
        let seqno = event.seqno();

        let mut state = self.lock_state();
        let state = &mut *state;

        let tile = self.tile_of_engine_instance(engine.1);
        if state.interrupt_sent && seqno <= state.eu_control_seqno[tile as usize] {
            log::debug!(
                "attention seqno {} answers an earlier request (interrupt seqno {}), discarded",
                seqno,
                state.eu_control_seqno[tile as usize]
            );
            return;
        }

        // The wave consumes one expected attention event even when it
        // cannot be attributed to a context below.
        if state.expected_attention_events > 0 {
            state.expected_attention_events -= 1;
        }

        let Some(conn) = state.connections.get(&client_handle) else {
            return;
        };
        let Some(&ctx) = conn.lrc_to_context.get(&lrc_handle) else {
            return;
        };
        let Some(info) = conn.contexts.get(&ctx) else {
            return;
        };
        let Some(vm) = info.vm else {
            return;
        };

        let threads = self.device.topology.threads_from_bitmask(tile, bitmask);
        log::debug!("attention on tile {} for {} threads", tile, threads.len());

        for id in threads {
            self.mark_pending_interrupt_or_newly_stopped(state, id, vm);
        }

        self.check_trigger_events_for_attention(state);
    }

    /// Folds one attention-raised thread into interrupt bookkeeping: a
    /// thread covered by a pending interrupt satisfies it, anything else
    /// newly stopped is queued for triage.
    fn mark_pending_interrupt_or_newly_stopped(
        &self,
        state: &mut SessionState,
        id: ThreadId,
        vm: u64,
    ) {
        let Some(ident) = self.read_system_routine_ident(state, id, vm) else {
            log::error!("state save slot unreadable for {}", id);
            return;
        };

        let thread = state.thread(id);
        let was_stopped = thread.is_stopped();
        if !thread.verify_stopped(ident.count) {
            return;
        }
        thread.stop(vm);

        let (slice, subslice, eu, th) = self.device.topology.to_api(id);
        let mut interrupted = false;
        for request in &mut state.pending_interrupts {
            if request.selector.covers(slice, subslice, eu, th) {
                request.satisfied = true;
                interrupted = true;
            }
        }

        if !interrupted && !was_stopped {
            state.newly_stopped.push(id);
        }
    }

    fn tile_of_engine_instance(&self, instance: u16) -> u32 {
        u32::from(instance) % self.device.topology.tile_count.max(1)
    }

    // -- acknowledgment -----------------------------------------------------

    /// Acknowledges an API event, echoing the originating kernel event.
    /// Module load events additionally release the bind acks deferred for
    /// the module's allocations.
    pub(super) fn acknowledge_event(&self, event: &ApiEvent) -> Result<()> {
        let mut state = self.lock_state();
        if let Some(pos) = state.events_to_ack.iter().position(|(e, _)| e == event) {
            let (_, ack) = state.events_to_ack.remove(pos);
            let kind = { ack.kind };
            let seqno = { ack.seqno };
            log::debug!("acking kernel event type {} seqno {}", kind, seqno);
            if let Err(err) = self.fd.ack_event(kind, seqno) {
                log::error!("event ack failed: {}", err);
            }
            return Ok(());
        }

        if let ApiEvent::ModuleLoad { load, .. } = event {
            return self.ack_isa_events(&mut state, *load);
        }
        Err(DebugError::Uninitialized(
            "event does not require acknowledgment".to_string(),
        ))
    }

    fn ack_isa_events(&self, state: &mut SessionState, load: u64) -> Result<()> {
        let address = decanonize(load);
        let Some(conn) = state.connection() else {
            return Err(DebugError::Uninitialized(
                "no client connection".to_string(),
            ));
        };
        for tile_map in conn.isa_map.iter_mut() {
            if let Some(isa) = tile_map.get_mut(&address) {
                for ack in isa.ack_events.drain(..) {
                    let kind = { ack.kind };
                    let seqno = { ack.seqno };
                    log::debug!("acking deferred vm bind seqno {}", seqno);
                    if let Err(err) = self.fd.ack_event(kind, seqno) {
                        log::error!("deferred vm bind ack failed: {}", err);
                    }
                }
                isa.module_load_event_acked = true;
                return Ok(());
            }
        }
        Err(DebugError::Uninitialized(format!(
            "no module loaded at {:#x}",
            load
        )))
    }
}

/// Pulls session-level addresses out of tracked-class UUID payloads.
fn extract_uuid_data(conn: &mut ClientConnection, data: &UuidData) {
    let Some(class) = data.class else {
        return;
    };

    if class.is_tracked_area() {
        if data.payload.len() != 8 {
            log::warn!(
                "tracked area uuid {:#x} payload is {} bytes, expected 8",
                data.handle,
                data.payload.len()
            );
            return;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data.payload);
        let gpu_va = u64::from_le_bytes(raw);
        match class {
            UuidClass::SbaTrackingBuffer => {
                log::debug!("sba tracking buffer at {:#x}", gpu_va);
                conn.sba_gpu_va = gpu_va;
            }
            UuidClass::ModuleDebugArea => {
                log::debug!("module debug area at {:#x}", gpu_va);
                conn.module_debug_area_gpu_va = gpu_va;
            }
            UuidClass::ContextSaveArea => {
                log::debug!("context save area at {:#x}", gpu_va);
                conn.context_save_area_gpu_va = gpu_va;
            }
            _ => {}
        }
    }

    if class == UuidClass::ZebinModule {
        let count = data
            .payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .unwrap_or(0);
        if let Some(module) = conn.modules.get_mut(&data.handle) {
            module.segment_count = count;
        }
    }
}
