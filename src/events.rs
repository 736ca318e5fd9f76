//! Event vocabulary.
//!
//! Raw kernel records are decoded into [`KernelEvent`] the moment they leave
//! the channel; everything downstream matches on the enum and never touches
//! raw bytes. [`ApiEvent`] is the application-facing product of handling
//! those kernel events.

use crate::threads::ThreadSelector;
use crate::uapi::{self, EngineClassInstance};

/// One engine entry of an ENGINES record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Engine {
    pub class: u16,
    pub instance: u16,
    pub lrc_handle: u64,
}

/// Decoded CONTEXT_PARAM payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextParamValue {
    /// The context's VM handle.
    Vm(u64),
    /// The context's engine list.
    Engines(Vec<(u16, u16)>),
    /// A parameter this session does not track.
    Other(u64),
}

/// A kernel debug event, decoded at the channel boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    Client {
        flags: u32,
        seqno: u64,
        handle: u64,
    },
    Context {
        flags: u32,
        seqno: u64,
        client_handle: u64,
        handle: u64,
    },
    Uuid {
        flags: u32,
        seqno: u64,
        client_handle: u64,
        handle: u64,
        class_handle: u64,
        payload_size: u64,
    },
    Vm {
        flags: u32,
        seqno: u64,
        client_handle: u64,
        handle: u64,
    },
    VmBind {
        flags: u32,
        seqno: u64,
        client_handle: u64,
        vm_handle: u64,
        va_start: u64,
        va_length: u64,
        uuids: Vec<u64>,
    },
    ContextParam {
        flags: u32,
        seqno: u64,
        client_handle: u64,
        ctx_handle: u64,
        param: ContextParamValue,
    },
    EuAttention {
        flags: u32,
        seqno: u64,
        client_handle: u64,
        ctx_handle: u64,
        lrc_handle: u64,
        engine: (u16, u16),
        bitmask: Vec<u8>,
    },
    Engines {
        flags: u32,
        seqno: u64,
        client_handle: u64,
        ctx_handle: u64,
        engines: Vec<Engine>,
    },
}

impl KernelEvent {
    pub fn is_create(&self) -> bool {
        self.flags() & uapi::FLAG_CREATE != 0
    }

    pub fn is_destroy(&self) -> bool {
        self.flags() & uapi::FLAG_DESTROY != 0
    }

    pub fn needs_ack(&self) -> bool {
        self.flags() & uapi::FLAG_NEED_ACK != 0
    }

    pub fn flags(&self) -> u32 {
        match *self {
            KernelEvent::Client { flags, .. }
            | KernelEvent::Context { flags, .. }
            | KernelEvent::Uuid { flags, .. }
            | KernelEvent::Vm { flags, .. }
            | KernelEvent::VmBind { flags, .. }
            | KernelEvent::ContextParam { flags, .. }
            | KernelEvent::EuAttention { flags, .. }
            | KernelEvent::Engines { flags, .. } => flags,
        }
    }

    pub fn seqno(&self) -> u64 {
        match *self {
            KernelEvent::Client { seqno, .. }
            | KernelEvent::Context { seqno, .. }
            | KernelEvent::Uuid { seqno, .. }
            | KernelEvent::Vm { seqno, .. }
            | KernelEvent::VmBind { seqno, .. }
            | KernelEvent::ContextParam { seqno, .. }
            | KernelEvent::EuAttention { seqno, .. }
            | KernelEvent::Engines { seqno, .. } => seqno,
        }
    }

    /// Event type constant for acknowledgment echoes.
    pub fn kind(&self) -> u32 {
        match self {
            KernelEvent::Client { .. } => uapi::EVENT_CLIENT,
            KernelEvent::Context { .. } => uapi::EVENT_CONTEXT,
            KernelEvent::Uuid { .. } => uapi::EVENT_UUID,
            KernelEvent::Vm { .. } => uapi::EVENT_VM,
            KernelEvent::VmBind { .. } => uapi::EVENT_VM_BIND,
            KernelEvent::ContextParam { .. } => uapi::EVENT_CONTEXT_PARAM,
            KernelEvent::EuAttention { .. } => uapi::EVENT_EU_ATTENTION,
            KernelEvent::Engines { .. } => uapi::EVENT_ENGINES,
        }
    }
}

/// Decodes one raw record. Unknown or truncated records return `None` and
/// are logged; the caller skips them.
pub fn decode(bytes: &[u8]) -> Option<KernelEvent> {
    let header: uapi::DebugEvent = uapi::decode_prefix(bytes)?;
    let kind = header.kind;
    let flags = header.flags;
    let seqno = header.seqno;

    match kind {
        uapi::EVENT_CLIENT => {
            let record: uapi::DebugEventClient = uapi::decode_prefix(bytes)?;
            Some(KernelEvent::Client {
                flags,
                seqno,
                handle: record.handle,
            })
        }
        uapi::EVENT_CONTEXT => {
            let record: uapi::DebugEventContext = uapi::decode_prefix(bytes)?;
            Some(KernelEvent::Context {
                flags,
                seqno,
                client_handle: record.client_handle,
                handle: record.handle,
            })
        }
        uapi::EVENT_UUID => {
            let record: uapi::DebugEventUuid = uapi::decode_prefix(bytes)?;
            Some(KernelEvent::Uuid {
                flags,
                seqno,
                client_handle: record.client_handle,
                handle: record.handle,
                class_handle: record.class_handle,
                payload_size: record.payload_size,
            })
        }
        uapi::EVENT_VM => {
            let record: uapi::DebugEventVm = uapi::decode_prefix(bytes)?;
            Some(KernelEvent::Vm {
                flags,
                seqno,
                client_handle: record.client_handle,
                handle: record.handle,
            })
        }
        uapi::EVENT_VM_BIND => {
            let record: uapi::DebugEventVmBind = uapi::decode_prefix(bytes)?;
            let fixed = std::mem::size_of::<uapi::DebugEventVmBind>();
            let count = record.num_uuids as usize;

            // A uuid list inconsistent with the record size is decoded as
            // empty; the handler then records no bind info for it.
            let mut uuids = Vec::new();
            if count > 0 {
                let needed = fixed + count * 8;
                if bytes.len() >= needed && header.size as usize >= needed {
                    for i in 0..count {
                        uuids.push(uapi::decode_u64_at(bytes, fixed + i * 8)?);
                    }
                } else {
                    log::warn!(
                        "vm-bind record with {} uuids but only {} bytes, ignoring uuid list",
                        count,
                        bytes.len()
                    );
                }
            }

            Some(KernelEvent::VmBind {
                flags,
                seqno,
                client_handle: record.client_handle,
                vm_handle: record.vm_handle,
                va_start: record.va_start,
                va_length: record.va_length,
                uuids,
            })
        }
        uapi::EVENT_CONTEXT_PARAM => {
            let record: uapi::DebugEventContextParam = uapi::decode_prefix(bytes)?;
            let param_id = record.param.param;
            let value = record.param.value;
            let param = match param_id {
                uapi::CONTEXT_PARAM_VM => ContextParamValue::Vm(value),
                uapi::CONTEXT_PARAM_ENGINES => {
                    // The engine array overlays the param value: u64
                    // extensions (the value field itself), then one
                    // class/instance pair per engine.
                    let fixed = std::mem::size_of::<uapi::DebugEventContextParam>();
                    let param_size = record.param.size as usize;
                    let num = param_size.saturating_sub(8) / 4;
                    let mut engines = Vec::with_capacity(num);
                    for i in 0..num {
                        let at = fixed + i * 4;
                        let entry: EngineClassInstance =
                            uapi::decode_prefix(bytes.get(at..)?)?;
                        engines.push((entry.engine_class, entry.engine_instance));
                    }
                    ContextParamValue::Engines(engines)
                }
                other => ContextParamValue::Other(other),
            };
            Some(KernelEvent::ContextParam {
                flags,
                seqno,
                client_handle: record.client_handle,
                ctx_handle: record.ctx_handle,
                param,
            })
        }
        uapi::EVENT_EU_ATTENTION => {
            let record: uapi::DebugEventEuAttention = uapi::decode_prefix(bytes)?;
            let fixed = std::mem::size_of::<uapi::DebugEventEuAttention>();
            let size = record.bitmask_size as usize;
            let bitmask = bytes.get(fixed..fixed + size)?.to_vec();
            let ci = record.ci;
            Some(KernelEvent::EuAttention {
                flags,
                seqno,
                client_handle: record.client_handle,
                ctx_handle: record.ctx_handle,
                lrc_handle: record.lrc_handle,
                engine: (ci.engine_class, ci.engine_instance),
                bitmask,
            })
        }
        uapi::EVENT_ENGINES => {
            let record: uapi::DebugEventEngines = uapi::decode_prefix(bytes)?;
            let fixed = std::mem::size_of::<uapi::DebugEventEngines>();
            let num = record.num_engines as usize;
            let mut engines = Vec::with_capacity(num);
            for i in 0..num {
                let at = fixed + i * std::mem::size_of::<uapi::EngineInfo>();
                let info: uapi::EngineInfo = uapi::decode_prefix(bytes.get(at..)?)?;
                let engine = info.engine;
                engines.push(Engine {
                    class: engine.engine_class,
                    instance: engine.engine_instance,
                    lrc_handle: info.lrc_handle,
                });
            }
            Some(KernelEvent::Engines {
                flags,
                seqno,
                client_handle: record.client_handle,
                ctx_handle: record.ctx_handle,
                engines,
            })
        }
        other => {
            let size = header.size;
            log::debug!(
                "unhandled kernel event type {} flags {:#x} size {}",
                other,
                flags,
                size
            );
            None
        }
    }
}

// ---------------------------------------------------------------------------
// API-visible events
// ---------------------------------------------------------------------------

/// Reason reported with a detach event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// The event channel became invalid underneath the session.
    Invalidated,
}

/// Events handed to the debugger application via `read_event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiEvent {
    /// The debugged process created its first command queue.
    ProcessEntry,
    /// The debugged process destroyed its last command queue.
    ProcessExit,
    /// The session lost its connection.
    Detached { reason: DetachReason },
    /// All segments of a module are bound and addressable.
    ModuleLoad {
        load: u64,
        module_begin: u64,
        module_end: u64,
        needs_ack: bool,
    },
    /// A previously reported module is gone.
    ModuleUnload {
        load: u64,
        module_begin: u64,
        module_end: u64,
    },
    /// A thread stopped and is ready for inspection. Carries the original
    /// selector for interrupt outcomes, a concrete thread otherwise.
    ThreadStopped { thread: ThreadSelector },
    /// An interrupted thread could not be stopped.
    ThreadUnavailable { thread: ThreadSelector },
}

impl ApiEvent {
    /// Whether the application must acknowledge this event.
    pub fn needs_ack(&self) -> bool {
        matches!(
            self,
            ApiEvent::ModuleLoad {
                needs_ack: true,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uapi::{
        DebugEvent, DebugEventClient, DebugEventContextParam, DebugEventEuAttention,
        DebugEventVmBind, EngineClassInstance, GemContextParam,
    };

    fn header(kind: u32, flags: u32, seqno: u64, size: usize) -> DebugEvent {
        DebugEvent {
            kind,
            flags,
            seqno,
            size: size as u64,
        }
    }

    #[test]
    fn decodes_client_create() {
        let record = DebugEventClient {
            base: header(uapi::EVENT_CLIENT, uapi::FLAG_CREATE, 1, 32),
            handle: 0x10,
        };
        let event = decode(&uapi::encode(&record)).unwrap();
        assert_eq!(
            event,
            KernelEvent::Client {
                flags: uapi::FLAG_CREATE,
                seqno: 1,
                handle: 0x10
            }
        );
        assert!(event.is_create());
        assert!(!event.is_destroy());
    }

    #[test]
    fn decodes_vm_bind_with_uuid_list() {
        let fixed = std::mem::size_of::<DebugEventVmBind>();
        let record = DebugEventVmBind {
            base: header(
                uapi::EVENT_VM_BIND,
                uapi::FLAG_CREATE | uapi::FLAG_NEED_ACK,
                9,
                fixed + 16,
            ),
            client_handle: 1,
            vm_handle: 3,
            va_start: 0x345000,
            va_length: 0x2000,
            num_uuids: 2,
            flags: 0,
        };
        let mut bytes = uapi::encode(&record);
        bytes.extend_from_slice(&5u64.to_le_bytes());
        bytes.extend_from_slice(&6u64.to_le_bytes());

        match decode(&bytes).unwrap() {
            KernelEvent::VmBind {
                vm_handle,
                va_start,
                uuids,
                ..
            } => {
                assert_eq!(vm_handle, 3);
                assert_eq!(va_start, 0x345000);
                assert_eq!(uuids, vec![5, 6]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn truncated_uuid_list_is_dropped() {
        let fixed = std::mem::size_of::<DebugEventVmBind>();
        let record = DebugEventVmBind {
            base: header(uapi::EVENT_VM_BIND, uapi::FLAG_CREATE, 9, fixed + 8),
            client_handle: 1,
            vm_handle: 3,
            va_start: 0x1000,
            va_length: 0x1000,
            num_uuids: 4,
            flags: 0,
        };
        let mut bytes = uapi::encode(&record);
        bytes.extend_from_slice(&5u64.to_le_bytes());

        match decode(&bytes).unwrap() {
            KernelEvent::VmBind { uuids, .. } => assert!(uuids.is_empty()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn decodes_engine_list_param() {
        let fixed = std::mem::size_of::<DebugEventContextParam>();
        let record = DebugEventContextParam {
            base: header(uapi::EVENT_CONTEXT_PARAM, uapi::FLAG_CREATE, 2, fixed + 8),
            client_handle: 1,
            ctx_handle: 20,
            param: GemContextParam {
                ctx_id: 20,
                // extensions u64 plus two class/instance pairs
                size: 16,
                param: uapi::CONTEXT_PARAM_ENGINES,
                value: 0,
            },
        };
        let mut bytes = uapi::encode(&record);
        for entry in [
            EngineClassInstance {
                engine_class: uapi::ENGINE_CLASS_COMPUTE,
                engine_instance: 0,
            },
            EngineClassInstance {
                engine_class: uapi::ENGINE_CLASS_RENDER,
                engine_instance: 1,
            },
        ] {
            bytes.extend_from_slice(&uapi::encode(&entry));
        }

        match decode(&bytes).unwrap() {
            KernelEvent::ContextParam {
                param: ContextParamValue::Engines(engines),
                ..
            } => {
                assert_eq!(
                    engines,
                    vec![(uapi::ENGINE_CLASS_COMPUTE, 0), (uapi::ENGINE_CLASS_RENDER, 1)]
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn decodes_attention_bitmask() {
        let fixed = std::mem::size_of::<DebugEventEuAttention>();
        let record = DebugEventEuAttention {
            base: header(uapi::EVENT_EU_ATTENTION, uapi::FLAG_STATE_CHANGE, 40, fixed + 3),
            client_handle: 1,
            ctx_handle: 20,
            lrc_handle: 1000,
            flags: 0,
            ci: EngineClassInstance {
                engine_class: uapi::ENGINE_CLASS_COMPUTE,
                engine_instance: 0,
            },
            bitmask_size: 3,
        };
        let mut bytes = uapi::encode(&record);
        bytes.extend_from_slice(&[0x01, 0x00, 0x02]);

        match decode(&bytes).unwrap() {
            KernelEvent::EuAttention {
                seqno,
                engine,
                bitmask,
                ..
            } => {
                assert_eq!(seqno, 40);
                assert_eq!(engine, (uapi::ENGINE_CLASS_COMPUTE, 0));
                assert_eq!(bitmask, vec![0x01, 0x00, 0x02]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn unknown_event_type_is_skipped() {
        let record = header(uapi::EVENT_PAGE_FAULT, uapi::FLAG_STATE_CHANGE, 3, 24);
        assert_eq!(decode(&uapi::encode(&record)), None);
    }
}
