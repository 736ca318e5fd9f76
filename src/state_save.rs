//! Thread state save area layout.
//!
//! Stopped threads spill their register state into a firmware-defined
//! region of the context save allocation. The region starts with a
//! self-describing header: a magic marker, a version, and per-thread slot
//! geometry plus one descriptor per register set. All offset math below
//! derives from that header rather than from hard-coded layout.

use crate::error::{DebugError, Result};
use crate::threads::ThreadId;
use crate::uapi;

pub const STATE_SAVE_MAGIC: [u8; 8] = *b"tssarea\0";
pub const SR_IDENT_MAGIC: [u8; 8] = *b"srmagic\0";
pub const DEBUG_AREA_MAGIC: [u8; 8] = *b"dbgarea\0";
pub const SBA_AREA_MAGIC: [u8; 8] = *b"sbaarea\0";

/// Value written to the SIP command slot to release a stopped thread.
pub const SIP_COMMAND_RESUME: u32 = 1;

/// Register sets exposed through the debug API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegsetType {
    /// General-purpose registers.
    Grf,
    /// Address register.
    Addr,
    /// Flag registers.
    Flag,
    /// Channel-enable mask.
    Ce,
    /// Status registers.
    Sr,
    /// Control registers.
    Cr,
    /// Thread-dependency register.
    Tdr,
    /// Accumulators.
    Acc,
    Mme,
    /// Stack pointer.
    Sp,
    /// State base addresses, synthesized rather than stored in the slot.
    Sba,
    /// Debug registers.
    Dbg,
    /// Flow-control registers.
    Fc,
}

impl RegsetType {
    pub fn is_writeable(self) -> bool {
        !matches!(
            self,
            RegsetType::Ce | RegsetType::Tdr | RegsetType::Sba | RegsetType::Mme
        )
    }
}

/// Slots of the synthesized SBA register set, in fixed order.
pub const SBA_GENERAL: u32 = 0;
pub const SBA_SURFACE: u32 = 1;
pub const SBA_DYNAMIC: u32 = 2;
pub const SBA_INDIRECT_OBJECT: u32 = 3;
pub const SBA_INSTRUCTION: u32 = 4;
pub const SBA_BINDLESS_SURFACE: u32 = 5;
pub const SBA_BINDLESS_SAMPLER: u32 = 6;
pub const SBA_BINDING_TABLE: u32 = 7;
pub const SBA_SCRATCH_SPACE: u32 = 8;
pub const SBA_COUNT: u32 = 9;

/// Descriptor for the SBA set, which has no slot storage behind it.
pub const SBA_REGSET: RegsetDesc = RegsetDesc {
    offset: 0,
    num: SBA_COUNT,
    bits: 64,
    bytes: 8,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SipVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VersionHeader {
    pub magic: [u8; 8],
    pub reserved1: u64,
    pub version: SipVersion,
    /// Total header size in 8-byte units.
    pub size: u32,
}

/// Location and shape of one register set inside a thread slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegsetDesc {
    /// Byte offset from the start of the thread slot.
    pub offset: u32,
    /// Number of registers in the set.
    pub num: u32,
    /// Architectural register width in bits.
    pub bits: u32,
    /// Stride between registers in bytes.
    pub bytes: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegHeader {
    pub num_slices: u32,
    pub num_subslices_per_slice: u32,
    pub num_eus_per_subslice: u32,
    pub num_threads_per_eu: u32,
    /// Byte offset of the first thread slot, from the end of the header.
    pub state_area_offset: u32,
    /// Thread slot stride in bytes.
    pub state_save_size: u32,
    /// Offset of the per-thread identification marker inside a slot.
    pub sr_magic_offset: u32,
    pub reserved: u32,
    pub grf: RegsetDesc,
    pub addr: RegsetDesc,
    pub flag: RegsetDesc,
    pub emask: RegsetDesc,
    pub sr: RegsetDesc,
    pub cr: RegsetDesc,
    pub tdr: RegsetDesc,
    pub acc: RegsetDesc,
    pub mme: RegsetDesc,
    pub sp: RegsetDesc,
    /// SIP command slot used to drive thread resume, internal only.
    pub cmd: RegsetDesc,
    pub dbg: RegsetDesc,
    pub fc: RegsetDesc,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StateSaveAreaHeader {
    pub version: VersionHeader,
    pub regs: RegHeader,
}

impl StateSaveAreaHeader {
    /// Parses and validates the header prefix of a context save area.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header: StateSaveAreaHeader = uapi::decode_prefix(bytes).ok_or_else(|| {
            DebugError::Unknown(format!("state save header truncated: {} bytes", bytes.len()))
        })?;
        if header.version.magic != STATE_SAVE_MAGIC {
            return Err(DebugError::Unknown(
                "state save area magic mismatch".to_string(),
            ));
        }
        Ok(header)
    }

    /// Header size in bytes, as declared by the header itself.
    pub fn declared_size(&self) -> u64 {
        u64::from(self.version.size) * 8
    }

    /// Whether the SIP version supports resume through the command slot.
    /// Older versions clear a control register instead.
    pub fn has_sip_command(&self) -> bool {
        self.version.version.major >= 2
    }

    /// Byte offset of a thread's slot from the start of the save area.
    pub fn thread_slot_offset(&self, id: ThreadId) -> u64 {
        let r = &self.regs;
        let slot = ((u64::from(id.slice) * u64::from(r.num_subslices_per_slice)
            + u64::from(id.subslice))
            * u64::from(r.num_eus_per_subslice)
            + u64::from(id.eu))
            * u64::from(r.num_threads_per_eu)
            + u64::from(id.thread);
        self.declared_size() + u64::from(r.state_area_offset) + slot * u64::from(r.state_save_size)
    }

    /// Byte offset of the identification marker inside a thread's slot.
    pub fn sr_ident_offset(&self, id: ThreadId) -> u64 {
        self.thread_slot_offset(id) + u64::from(self.regs.sr_magic_offset)
    }

    pub fn regset(&self, kind: RegsetType) -> &RegsetDesc {
        match kind {
            RegsetType::Grf => &self.regs.grf,
            RegsetType::Addr => &self.regs.addr,
            RegsetType::Flag => &self.regs.flag,
            RegsetType::Ce => &self.regs.emask,
            RegsetType::Sr => &self.regs.sr,
            RegsetType::Cr => &self.regs.cr,
            RegsetType::Tdr => &self.regs.tdr,
            RegsetType::Acc => &self.regs.acc,
            RegsetType::Mme => &self.regs.mme,
            RegsetType::Sp => &self.regs.sp,
            RegsetType::Sba => &SBA_REGSET,
            RegsetType::Dbg => &self.regs.dbg,
            RegsetType::Fc => &self.regs.fc,
        }
    }

    /// Offset of register `start` of a set inside the thread slot, after
    /// bounds-checking the `start + count` range against the set.
    pub fn register_offset(&self, kind: RegsetType, start: u32, count: u32) -> Result<u64> {
        let desc = self.regset(kind);
        if start >= desc.num || u64::from(start) + u64::from(count) > u64::from(desc.num) {
            return Err(DebugError::InvalidArgument(format!(
                "register range {}..{} outside set of {}",
                start,
                u64::from(start) + u64::from(count),
                desc.num
            )));
        }
        Ok(u64::from(desc.offset) + u64::from(desc.bytes) * u64::from(start))
    }

    /// Properties of every non-empty register set, in enumeration order.
    pub fn regset_properties(&self) -> Vec<RegsetProperties> {
        const ORDER: [RegsetType; 13] = [
            RegsetType::Grf,
            RegsetType::Addr,
            RegsetType::Flag,
            RegsetType::Ce,
            RegsetType::Sr,
            RegsetType::Cr,
            RegsetType::Tdr,
            RegsetType::Acc,
            RegsetType::Mme,
            RegsetType::Sp,
            RegsetType::Sba,
            RegsetType::Dbg,
            RegsetType::Fc,
        ];
        ORDER
            .iter()
            .filter_map(|&kind| {
                let desc = self.regset(kind);
                if desc.num == 0 {
                    return None;
                }
                Some(RegsetProperties {
                    kind,
                    num: desc.num,
                    bits: desc.bits,
                    bytes: desc.bytes,
                    writeable: kind.is_writeable(),
                })
            })
            .collect()
    }
}

/// Shape of one register set as reported to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegsetProperties {
    pub kind: RegsetType,
    pub num: u32,
    pub bits: u32,
    pub bytes: u32,
    pub writeable: bool,
}

/// Per-thread identification marker written by SIP when a thread enters
/// the save area. `count` increments on every entry, odd while stopped.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SrIdent {
    pub magic: [u8; 8],
    pub version: u32,
    pub count: u32,
}

impl SrIdent {
    pub const SIZE: usize = 16;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let ident: SrIdent = uapi::decode_prefix(bytes)
            .ok_or_else(|| DebugError::Unknown("sr ident truncated".to_string()))?;
        if ident.magic != SR_IDENT_MAGIC {
            return Err(DebugError::Unknown("sr ident magic mismatch".to_string()));
        }
        Ok(ident)
    }
}

/// Base addresses mirrored into the SBA tracking allocation by the
/// command streamer. Read raw; the producer owns the magic.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SbaTrackedAddresses {
    pub magic: [u8; 8],
    pub reserved1: u64,
    pub version: u32,
    pub reserved2: u32,
    pub general_state_base: u64,
    pub surface_state_base: u64,
    pub dynamic_state_base: u64,
    pub indirect_object_base: u64,
    pub instruction_base: u64,
    pub bindless_surface_state_base: u64,
    pub bindless_sampler_state_base: u64,
}

impl SbaTrackedAddresses {
    pub const SIZE: usize = 80;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        uapi::decode_prefix(bytes)
            .ok_or_else(|| DebugError::Unknown("sba buffer truncated".to_string()))
    }
}

pub const RENDER_SURFACE_STATE_SIZE: usize = 64;

/// Surface pitch field of a render surface state, in bytes.
pub fn surface_state_pitch(state: &[u8]) -> u64 {
    let dword3 = state
        .get(12..16)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0);
    u64::from((dword3 & 0x3ffff) + 1)
}

/// Surface base address field of a render surface state.
pub fn surface_state_base_address(state: &[u8]) -> u64 {
    state
        .get(32..40)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

/// Header of the module debug area allocation.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DebugAreaHeader {
    pub magic: [u8; 8],
    pub reserved1: u64,
    pub version: u32,
    pub flags: u32,
}

/// Debug area flag: process runs with a shared, bindless SIP.
pub const DEBUG_AREA_SHARED: u32 = 1 << 0;

impl DebugAreaHeader {
    pub const SIZE: usize = 24;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header: DebugAreaHeader = uapi::decode_prefix(bytes)
            .ok_or_else(|| DebugError::Unknown("debug area header truncated".to_string()))?;
        if header.magic != DEBUG_AREA_MAGIC {
            return Err(DebugError::Unknown(
                "module debug area magic mismatch".to_string(),
            ));
        }
        Ok(header)
    }

    pub fn is_shared(&self) -> bool {
        self.flags & DEBUG_AREA_SHARED != 0
    }
}

/// Builds a coherent header for the given thread geometry, register sets
/// packed back to back. Used by bring-up tooling and test fixtures.
pub fn build_header(
    version_major: u32,
    slices: u32,
    subslices_per_slice: u32,
    eus_per_subslice: u32,
    threads_per_eu: u32,
) -> StateSaveAreaHeader {
    let mut offset = 0u32;
    let mut place = |num: u32, bits: u32, bytes: u32| {
        let desc = RegsetDesc {
            offset,
            num,
            bits,
            bytes,
        };
        offset += num * bytes;
        desc
    };

    let grf = place(128, 256, 32);
    let addr = place(1, 256, 32);
    let flag = place(2, 32, 4);
    let emask = place(1, 32, 4);
    let sr = place(2, 128, 16);
    let cr = place(4, 128, 16);
    let tdr = place(1, 128, 16);
    let acc = place(4, 256, 32);
    let mme = place(8, 256, 32);
    let sp = place(1, 128, 16);
    let cmd = place(1, 128, 16);
    let dbg = place(2, 32, 4);
    let fc = place(3, 128, 16);

    let sr_magic_offset = offset;
    offset += SrIdent::SIZE as u32;
    let state_save_size = offset.next_multiple_of(64);

    let header_bytes = std::mem::size_of::<StateSaveAreaHeader>() as u32;

    StateSaveAreaHeader {
        version: VersionHeader {
            magic: STATE_SAVE_MAGIC,
            reserved1: 0,
            version: SipVersion {
                major: version_major,
                minor: 0,
                patch: 0,
            },
            size: header_bytes.div_ceil(8),
        },
        regs: RegHeader {
            num_slices: slices,
            num_subslices_per_slice: subslices_per_slice,
            num_eus_per_subslice: eus_per_subslice,
            num_threads_per_eu: threads_per_eu,
            state_area_offset: 0,
            state_save_size,
            sr_magic_offset,
            reserved: 0,
            grf,
            addr,
            flag,
            emask,
            sr,
            cr,
            tdr,
            acc,
            mme,
            sp,
            cmd,
            dbg,
            fc,
        },
    }
}
