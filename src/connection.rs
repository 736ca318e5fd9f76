//! Per-client bookkeeping for a debug connection.
//!
//! The kernel channel describes the debuggee in terms of opaque handles:
//! clients, contexts, VMs, UUIDs and VM binds. This module keeps the maps
//! those handles index into, plus the resource classes the driver attaches
//! to allocations through metadata UUIDs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::uapi;

/// Per-tile bookkeeping slots.
pub const MAX_TILES: usize = 4;

/// Sentinel for handle fields the kernel has not filled in.
pub const INVALID_HANDLE: u64 = u64::MAX;

// -- canonical GPU addresses ------------------------------------------------

/// Sign-extends bit 47 upward, the form load addresses are reported in.
pub const fn canonize(address: u64) -> u64 {
    ((address << 16) as i64 >> 16) as u64
}

/// Strips the canonical sign extension before handing an address to the
/// kernel or using it as a map key.
pub const fn decanonize(address: u64) -> u64 {
    address & 0x0000_ffff_ffff_ffff
}

// -- metadata UUID classes --------------------------------------------------

/// Resource classes a class-definition UUID can declare. Allocations tag
/// themselves with one of these by listing the class UUID handle in their
/// VM bind events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UuidClass {
    Elf,
    Isa,
    ModuleDebugArea,
    ContextSaveArea,
    SbaTrackingBuffer,
    ZebinModule,
}

impl UuidClass {
    /// Classes whose payload carries the GPU VA of a per-process area the
    /// debugger reads directly.
    pub fn is_tracked_area(self) -> bool {
        matches!(
            self,
            UuidClass::SbaTrackingBuffer | UuidClass::ModuleDebugArea | UuidClass::ContextSaveArea
        )
    }
}

/// Class-definition UUID hashes registered by the driver, paired with the
/// class they declare.
pub const CLASS_UUID_HASHES: [(&str, UuidClass); 6] = [
    ("e27020ca-2b29-4e6f-9e56-2ac4b1d6d1b4", UuidClass::Elf),
    ("9e558b00-7a4f-4d0e-8a79-43e4d366e1d1", UuidClass::Isa),
    ("e3b24c26-6a6b-4a35-a4a1-9b5d4c0e5a47", UuidClass::ModuleDebugArea),
    ("8cc0dc78-0c6e-4b42-9b37-7161a3e0ad5e", UuidClass::ContextSaveArea),
    ("1f5b3c84-9d7a-4eb9-9f0c-9cbec3e2dc23", UuidClass::SbaTrackingBuffer),
    ("ab76a8c3-2c4a-4c3b-8d2f-84a6f9bd5e0f", UuidClass::ZebinModule),
];

/// UUID hash announcing a command queue. Its payload names the subdevice
/// the queue runs on.
pub const COMMAND_QUEUE_UUID_HASH: &str = "d7b69b6a-0d9e-4bb1-8f0a-6e2c5d5b9a0e";

/// Looks a 36-character UUID string up in the class table.
pub fn class_from_hash(uuid: &str) -> Option<UuidClass> {
    CLASS_UUID_HASHES
        .iter()
        .find(|(hash, _)| *hash == uuid)
        .map(|&(_, class)| class)
}

/// Payload of a command queue UUID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandQueueNotification {
    pub subdevice_index: u32,
    pub subdevice_count: u32,
}

impl CommandQueueNotification {
    pub const SIZE: usize = 8;

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() != Self::SIZE {
            return None;
        }
        let index = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let count = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
        Some(Self {
            subdevice_index: index,
            subdevice_count: count,
        })
    }
}

/// Extracts the CPU VA an ELF binary UUID encodes in its last two groups:
/// `xxxxxxxx-xxxx-xxxx-hhhh-llllllllllll` carries bits 63:48 in `hhhh` and
/// bits 47:0 in the 12-character tail.
pub fn va_from_uuid_string(uuid: &str) -> u64 {
    let field = |range| {
        uuid.get(range)
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            .unwrap_or(0)
    };
    let high = field(19..23);
    let low = field(24..36);
    low | ((high & 0xffff) << 48)
}

// -- connection state -------------------------------------------------------

/// Metadata UUID registered by the debuggee driver.
#[derive(Debug, Clone, Default)]
pub struct UuidData {
    pub handle: u64,
    pub class_handle: u64,
    pub class: Option<UuidClass>,
    pub payload: Vec<u8>,
    /// CPU VA parsed out of an ELF binary UUID string.
    pub ptr: u64,
}

/// GPU VA range a resource is bound at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindInfo {
    pub gpu_va: u64,
    pub size: u64,
}

impl BindInfo {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.gpu_va && address < self.gpu_va + self.size
    }
}

/// One ISA allocation announced through a VM bind.
#[derive(Debug, Default)]
pub struct IsaAllocation {
    pub bind_info: BindInfo,
    pub vm_handle: u64,
    /// ELF binary UUID listed alongside the ISA cookie, if any.
    pub elf_handle: Option<u64>,
    pub module_begin: u64,
    pub module_end: u64,
    /// Bound once per tile rather than once per device.
    pub tile_instanced: bool,
    /// Legacy modules bind one ISA allocation per kernel and report module
    /// load per allocation.
    pub per_kernel_module: bool,
    pub vm_bind_counter: u64,
    /// Bind acks deferred until the module load event is acknowledged.
    pub ack_events: Vec<uapi::EventAck>,
    pub module_load_event_acked: bool,
}

/// A zebin module aggregating several ISA segments.
#[derive(Debug, Default)]
pub struct ModuleEntry {
    pub segment_count: u32,
    pub elf_handle: Option<u64>,
    pub segment_vm_bind_counter: [u64; MAX_TILES],
    pub load_addresses: [BTreeSet<u64>; MAX_TILES],
}

impl ModuleEntry {
    /// Lowest segment address on a tile, the module load address.
    pub fn min_load_address(&self, tile: usize) -> Option<u64> {
        self.load_addresses[tile].iter().next().copied()
    }
}

/// Context state learned from context-param events.
#[derive(Debug, Clone, Default)]
pub struct ContextInfo {
    pub vm: Option<u64>,
    pub engines: Vec<(u16, u16)>,
}

/// Everything known about one kernel client of the debugged process.
#[derive(Debug, Default)]
pub struct ClientConnection {
    pub handle: u64,
    pub contexts: HashMap<u64, ContextInfo>,
    pub vm_ids: HashSet<u64>,
    pub vm_to_tile: HashMap<u64, u32>,
    pub lrc_to_context: HashMap<u64, u64>,
    pub uuids: HashMap<u64, UuidData>,
    /// Class-definition UUID handle to (class name, class).
    pub class_handles: HashMap<u64, (String, UuidClass)>,
    /// Decanonized ISA VA to allocation, per tile.
    pub isa_map: [HashMap<u64, IsaAllocation>; MAX_TILES],
    /// Module begin CPU VA to ELF UUID handle, ordered for range lookup.
    pub elf_map: BTreeMap<u64, u64>,
    /// Zebin module UUID handle to module entry.
    pub modules: HashMap<u64, ModuleEntry>,
    pub vm_to_sba: HashMap<u64, BindInfo>,
    pub vm_to_module_debug_area: HashMap<u64, BindInfo>,
    pub vm_to_context_save_area: HashMap<u64, BindInfo>,
    pub sba_gpu_va: u64,
    pub module_debug_area_gpu_va: u64,
    pub context_save_area_gpu_va: u64,
}

impl ClientConnection {
    pub fn new(handle: u64) -> Self {
        Self {
            handle,
            ..Default::default()
        }
    }

    /// ELF image containing `address`, as (uuid handle, offset into image).
    pub fn find_elf(&self, address: u64, size: u64) -> Option<(u64, u64)> {
        let (&begin, &handle) = self.elf_map.range(..=address).next_back()?;
        let data_size = self.uuids.get(&handle)?.payload.len() as u64;
        if address + size > begin + data_size {
            return None;
        }
        Some((handle, address - begin))
    }

    /// ISA allocation containing `address` on a tile.
    pub fn find_isa(&self, tile: usize, address: u64, size: u64) -> IsaLookup<'_> {
        for isa in self.isa_map[tile].values() {
            let bind = isa.bind_info;
            if bind.contains(address) {
                if address + size > bind.gpu_va + bind.size {
                    return IsaLookup::CrossesBoundary;
                }
                return IsaLookup::Hit(isa);
            }
        }
        IsaLookup::Miss
    }
}

/// Outcome of resolving an address against the ISA map.
#[derive(Debug)]
pub enum IsaLookup<'a> {
    Hit(&'a IsaAllocation),
    /// Access starts inside an allocation but runs past its end.
    CrossesBoundary,
    Miss,
}
