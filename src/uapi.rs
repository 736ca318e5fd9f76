//! Prelim i915 debugger uapi mirror.
//!
//! Wire records read from the event channel and the argument structs of the
//! debugger ioctls, bit-for-bit compatible with the kernel definitions. All
//! record structs are packed; copy fields out before use, never borrow them.

use std::mem::size_of;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

pub const EVENT_NONE: u32 = 0;
pub const EVENT_READ: u32 = 1;
pub const EVENT_CLIENT: u32 = 2;
pub const EVENT_CONTEXT: u32 = 3;
pub const EVENT_UUID: u32 = 4;
pub const EVENT_VM: u32 = 5;
pub const EVENT_VM_BIND: u32 = 6;
pub const EVENT_CONTEXT_PARAM: u32 = 7;
pub const EVENT_EU_ATTENTION: u32 = 8;
pub const EVENT_ENGINES: u32 = 9;
pub const EVENT_PAGE_FAULT: u32 = 10;

// Event flags
pub const FLAG_CREATE: u32 = 1 << 31;
pub const FLAG_DESTROY: u32 = 1 << 30;
pub const FLAG_STATE_CHANGE: u32 = 1 << 29;
pub const FLAG_NEED_ACK: u32 = 1 << 28;

// EU control commands
pub const EU_CONTROL_CMD_INTERRUPT_ALL: u32 = 0;
pub const EU_CONTROL_CMD_STOPPED: u32 = 1;
pub const EU_CONTROL_CMD_RESUME: u32 = 2;
pub const EU_CONTROL_CMD_INTERRUPT: u32 = 3;

// VM open access modes (O_RDONLY / O_RDWR)
pub const VM_OPEN_READ_ONLY: u64 = 0;
pub const VM_OPEN_READ_WRITE: u64 = 2;

// Context parameters reported via CONTEXT_PARAM events
pub const CONTEXT_PARAM_VM: u64 = 0x9;
pub const CONTEXT_PARAM_ENGINES: u64 = 0xa;

// Engine classes
pub const ENGINE_CLASS_RENDER: u16 = 0;
pub const ENGINE_CLASS_COMPUTE: u16 = 4;

/// Largest record the kernel will hand back from one read.
pub const MAX_EVENT_SIZE: usize = 4096;

// ---------------------------------------------------------------------------
// ioctl request codes
// ---------------------------------------------------------------------------

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u8, nr: u8, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | (nr as u64)
}

const fn io(ty: u8, nr: u8) -> u64 {
    ioc(0, ty, nr, 0)
}

const fn iow(ty: u8, nr: u8, size: usize) -> u64 {
    ioc(IOC_WRITE, ty, nr, size)
}

const fn iowr(ty: u8, nr: u8, size: usize) -> u64 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

const DEBUG_MAGIC: u8 = b'j';
const DRM_MAGIC: u8 = b'd';
const DRM_COMMAND_BASE: u8 = 0x40;
const DEBUGGER_OPEN_NR: u8 = 0x56;

pub const IOCTL_READ_EVENT: u64 = io(DEBUG_MAGIC, 0x0);
pub const IOCTL_READ_UUID: u64 = iowr(DEBUG_MAGIC, 0x1, size_of::<ReadUuid>());
pub const IOCTL_VM_OPEN: u64 = iow(DEBUG_MAGIC, 0x2, size_of::<VmOpen>());
pub const IOCTL_EU_CONTROL: u64 = iowr(DEBUG_MAGIC, 0x3, size_of::<EuControl>());
pub const IOCTL_ACK_EVENT: u64 = iow(DEBUG_MAGIC, 0x4, size_of::<EventAck>());

/// Issued on the DRM render node, not the debug fd.
pub const IOCTL_DEBUGGER_OPEN: u64 = iowr(
    DRM_MAGIC,
    DRM_COMMAND_BASE + DEBUGGER_OPEN_NR,
    size_of::<DebuggerOpenParam>(),
);

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// Common header of every record on the event channel.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct DebugEvent {
    pub kind: u32,
    pub flags: u32,
    pub seqno: u64,
    pub size: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct DebugEventClient {
    pub base: DebugEvent,
    pub handle: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct DebugEventContext {
    pub base: DebugEvent,
    pub client_handle: u64,
    pub handle: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct DebugEventUuid {
    pub base: DebugEvent,
    pub client_handle: u64,
    pub handle: u64,
    pub class_handle: u64,
    pub payload_size: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct DebugEventVm {
    pub base: DebugEvent,
    pub client_handle: u64,
    pub handle: u64,
}

/// Fixed prefix of a VM_BIND record; `num_uuids` u64 handles follow.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct DebugEventVmBind {
    pub base: DebugEvent,
    pub client_handle: u64,
    pub vm_handle: u64,
    pub va_start: u64,
    pub va_length: u64,
    pub num_uuids: u32,
    pub flags: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct EngineClassInstance {
    pub engine_class: u16,
    pub engine_instance: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct GemContextParam {
    pub ctx_id: u32,
    pub size: u32,
    pub param: u64,
    pub value: u64,
}

/// CONTEXT_PARAM record. For CONTEXT_PARAM_ENGINES the engine list is
/// inlined after `param.value`, `param.size` bytes in total.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct DebugEventContextParam {
    pub base: DebugEvent,
    pub client_handle: u64,
    pub ctx_handle: u64,
    pub param: GemContextParam,
}

/// Fixed prefix of an EU_ATTENTION record; `bitmask_size` bytes follow.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct DebugEventEuAttention {
    pub base: DebugEvent,
    pub client_handle: u64,
    pub ctx_handle: u64,
    pub lrc_handle: u64,
    pub flags: u32,
    pub ci: EngineClassInstance,
    pub bitmask_size: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct EngineInfo {
    pub engine: EngineClassInstance,
    pub lrc_handle: u64,
}

/// Fixed prefix of an ENGINES record; `num_engines` EngineInfo follow.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct DebugEventEngines {
    pub base: DebugEvent,
    pub client_handle: u64,
    pub ctx_handle: u64,
    pub num_engines: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ReadUuid {
    pub client_handle: u64,
    pub handle: u64,
    pub flags: u32,
    pub uuid: [u8; 36],
    pub payload_ptr: u64,
    pub payload_size: u64,
}

impl Default for ReadUuid {
    fn default() -> Self {
        Self {
            client_handle: 0,
            handle: 0,
            flags: 0,
            uuid: [0; 36],
            payload_ptr: 0,
            payload_size: 0,
        }
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct VmOpen {
    pub client_handle: u64,
    pub handle: u64,
    pub flags: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct EuControl {
    pub client_handle: u64,
    pub cmd: u32,
    pub flags: u32,
    pub seqno: u64,
    pub ci: EngineClassInstance,
    pub bitmask_size: u32,
    pub bitmask_ptr: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventAck {
    pub kind: u32,
    pub flags: u32,
    pub seqno: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct DebuggerOpenParam {
    pub pid: u64,
    pub flags: u32,
    pub version: u32,
    pub events: u64,
    pub extensions: u64,
}

// ---------------------------------------------------------------------------
// Raw byte helpers
// ---------------------------------------------------------------------------

/// Serializes a wire record to the bytes the kernel would produce.
pub fn encode<T: Copy>(value: &T) -> Vec<u8> {
    let ptr = value as *const T as *const u8;
    // Packed repr(C): the in-memory form is the wire form.
    unsafe { std::slice::from_raw_parts(ptr, size_of::<T>()) }.to_vec()
}

/// Reads a wire record from the front of a byte buffer, if it fits.
pub fn decode_prefix<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < size_of::<T>() {
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// Reads a little-endian u64 at `offset`.
pub fn decode_u64_at(bytes: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(8)?;
    if end > bytes.len() {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..end]);
    Some(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_kernel_layout() {
        assert_eq!(size_of::<DebugEvent>(), 24);
        assert_eq!(size_of::<DebugEventClient>(), 32);
        assert_eq!(size_of::<DebugEventContext>(), 40);
        assert_eq!(size_of::<DebugEventUuid>(), 56);
        assert_eq!(size_of::<DebugEventVm>(), 40);
        assert_eq!(size_of::<DebugEventVmBind>(), 64);
        assert_eq!(size_of::<DebugEventContextParam>(), 64);
        assert_eq!(size_of::<DebugEventEuAttention>(), 60);
        assert_eq!(size_of::<DebugEventEngines>(), 48);
        assert_eq!(size_of::<EngineInfo>(), 12);
        assert_eq!(size_of::<ReadUuid>(), 72);
        assert_eq!(size_of::<VmOpen>(), 24);
        assert_eq!(size_of::<EuControl>(), 40);
        assert_eq!(size_of::<EventAck>(), 16);
        assert_eq!(size_of::<DebuggerOpenParam>(), 32);
    }

    #[test]
    fn request_codes_match_kernel_macros() {
        // _IO('j', 0x0)
        assert_eq!(IOCTL_READ_EVENT, 0x6a00);
        // _IOWR('j', 0x1, 72)
        assert_eq!(IOCTL_READ_UUID, 0xc048_6a01);
        // _IOW('j', 0x2, 24)
        assert_eq!(IOCTL_VM_OPEN, 0x4018_6a02);
        // _IOWR('j', 0x3, 40)
        assert_eq!(IOCTL_EU_CONTROL, 0xc028_6a03);
        // _IOW('j', 0x4, 16)
        assert_eq!(IOCTL_ACK_EVENT, 0x4010_6a04);
        // DRM_IOWR(0x40 + 0x56, 32)
        assert_eq!(IOCTL_DEBUGGER_OPEN, 0xc020_6496);
    }

    #[test]
    fn encode_decode_round_trip_preserves_header() {
        let event = DebugEventClient {
            base: DebugEvent {
                kind: EVENT_CLIENT,
                flags: FLAG_CREATE,
                seqno: 7,
                size: size_of::<DebugEventClient>() as u64,
            },
            handle: 0x1122_3344,
        };
        let bytes = encode(&event);
        assert_eq!(bytes.len(), 32);

        let back: DebugEventClient = decode_prefix(&bytes).unwrap();
        let handle = back.handle;
        let kind = back.base.kind;
        assert_eq!(handle, 0x1122_3344);
        assert_eq!(kind, EVENT_CLIENT);
        assert_eq!(decode_u64_at(&bytes, 24), Some(0x1122_3344));
    }
}
