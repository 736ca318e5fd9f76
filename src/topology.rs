//! Device thread topology.
//!
//! Translates between the API thread space (logical indices over enabled
//! slices, tiles folded into the slice dimension) and the physical space the
//! hardware reports in attention bitmasks and expects in EU control
//! bitmasks. Fused-off slices and subslices make the two spaces differ.

use crate::threads::{ThreadId, ThreadSelector, ALL};

/// Static description of the attached device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub topology: DeviceTopology,
    /// Device erratum: EU control resume bitmasks act on EU pairs.
    pub resume_wa: bool,
    /// Whether scratch base comes from the surface-state heap instead of a
    /// raw register field.
    pub scratch_via_surface_state: bool,
}

impl DeviceInfo {
    pub fn new(topology: DeviceTopology) -> Self {
        Self {
            topology,
            resume_wa: false,
            scratch_via_surface_state: false,
        }
    }

    /// Engine that EU control requests target on a tile. Compute engine 0
    /// of the tile carries the debug attention plumbing.
    pub fn control_engine(&self, tile: u32) -> (u16, u16) {
        (crate::uapi::ENGINE_CLASS_COMPUTE, tile as u16)
    }
}

/// Thread layout of one device, shared by all its tiles.
#[derive(Debug, Clone)]
pub struct DeviceTopology {
    pub tile_count: u32,
    /// Enabled physical slice ids, in logical order.
    pub slice_indices: Vec<u32>,
    /// Enabled physical subslice ids within the slice. Only meaningful for
    /// single-slice parts, where the hardware reports real subslice ids.
    pub subslice_indices: Vec<u32>,
    /// Physical slice span of attention/control bitmasks.
    pub max_slices: u32,
    pub subslices_per_slice: u32,
    pub eus_per_subslice: u32,
    pub threads_per_eu: u32,
}

impl DeviceTopology {
    /// Fully-enabled topology, mostly for tests and bring-up.
    pub fn uniform(
        tile_count: u32,
        slices: u32,
        subslices_per_slice: u32,
        eus_per_subslice: u32,
        threads_per_eu: u32,
    ) -> Self {
        Self {
            tile_count,
            slice_indices: (0..slices).collect(),
            subslice_indices: (0..subslices_per_slice).collect(),
            max_slices: slices,
            subslices_per_slice,
            eus_per_subslice,
            threads_per_eu,
        }
    }

    /// Enabled slices visible through the API, per tile.
    pub fn api_slice_count(&self) -> u32 {
        self.slice_indices.len() as u32
    }

    fn single_slice(&self) -> bool {
        self.slice_indices.len() == 1
    }

    /// EU span of attention bitmasks. The hardware reports at most 8
    /// attention EU slots per subslice (lockstepped pairs beyond that).
    pub fn attention_eus(&self) -> u32 {
        self.eus_per_subslice.min(8)
    }

    fn bytes_per_eu(&self) -> usize {
        self.threads_per_eu.div_ceil(8) as usize
    }

    pub fn bitmask_size(&self) -> usize {
        self.max_slices as usize
            * self.subslices_per_slice as usize
            * self.attention_eus() as usize
            * self.bytes_per_eu()
    }

    /// Which tile an API selector addresses; `None` means all tiles.
    pub fn tile_of(&self, selector: ThreadSelector) -> Option<u32> {
        if selector.slice == ALL {
            if self.tile_count > 1 {
                None
            } else {
                Some(0)
            }
        } else {
            Some(selector.slice / self.api_slice_count())
        }
    }

    /// Rewrites logical indices as physical ones within a tile.
    ///
    /// A single-slice part collapses an "all slices" wildcard onto its one
    /// enabled slice so that the subslice remap below still applies; on
    /// multi-slice parts the wildcard survives and expansion walks the
    /// enabled slice list instead.
    pub fn to_physical(&self, mut selector: ThreadSelector) -> ThreadSelector {
        if selector.slice != ALL {
            let logical = selector.slice % self.api_slice_count();
            selector.slice = self.slice_indices[logical as usize];
        } else if self.single_slice() {
            selector.slice = self.slice_indices[0];
        }

        if self.single_slice() && selector.subslice != ALL {
            let idx = selector.subslice as usize;
            if idx < self.subslice_indices.len() {
                selector.subslice = self.subslice_indices[idx];
            }
        }
        selector
    }

    /// Expands a physical selector into concrete threads on one tile.
    pub fn expand(&self, tile: u32, physical: ThreadSelector) -> Vec<ThreadId> {
        let slices: Vec<u32> = if physical.slice == ALL {
            self.slice_indices.clone()
        } else {
            vec![physical.slice]
        };
        let subslices: Vec<u32> = if physical.subslice == ALL {
            if self.single_slice() {
                self.subslice_indices.clone()
            } else {
                (0..self.subslices_per_slice).collect()
            }
        } else {
            vec![physical.subslice]
        };
        let eus: Vec<u32> = if physical.eu == ALL {
            (0..self.eus_per_subslice).collect()
        } else {
            vec![physical.eu]
        };
        let threads: Vec<u32> = if physical.thread == ALL {
            (0..self.threads_per_eu).collect()
        } else {
            vec![physical.thread]
        };

        let mut out =
            Vec::with_capacity(slices.len() * subslices.len() * eus.len() * threads.len());
        for &s in &slices {
            for &ss in &subslices {
                for &eu in &eus {
                    for &th in &threads {
                        out.push(ThreadId::new(tile, s, ss, eu, th));
                    }
                }
            }
        }
        out
    }

    /// Converts API thread selector to the concrete threads it addresses on
    /// a given tile.
    pub fn resolve(&self, tile: u32, selector: ThreadSelector) -> Vec<ThreadId> {
        self.expand(tile, self.to_physical(selector))
    }

    /// Byte offset of a thread's scratch slot given its per-thread scratch
    /// size. Threads are laid out flat in slice-major order.
    pub fn per_thread_scratch_offset(&self, ptss: u64, id: ThreadId) -> u64 {
        let index = ((u64::from(id.slice) * u64::from(self.subslices_per_slice)
            + u64::from(id.subslice))
            * u64::from(self.eus_per_subslice)
            + u64::from(id.eu))
            * u64::from(self.threads_per_eu)
            + u64::from(id.thread);
        index * ptss
    }

    /// Maps a concrete physical thread back into API space.
    pub fn to_api(&self, id: ThreadId) -> (u32, u32, u32, u32) {
        let logical_slice = self
            .slice_indices
            .iter()
            .position(|&s| s == id.slice)
            .map(|p| p as u32)
            .unwrap_or(id.slice);
        let slice = logical_slice + id.tile * self.api_slice_count();

        let subslice = if self.single_slice() {
            self.subslice_indices
                .iter()
                .position(|&s| s == id.subslice)
                .map(|p| p as u32)
                .unwrap_or(id.subslice)
        } else {
            id.subslice
        };

        (slice, subslice, id.eu, id.thread)
    }

    // -- attention / EU control bitmasks ------------------------------------

    fn bit_offset(&self, slice: u32, subslice: u32, eu: u32) -> usize {
        let bytes_per_eu = self.bytes_per_eu();
        let per_subslice = self.attention_eus() as usize * bytes_per_eu;
        let per_slice = self.subslices_per_slice as usize * per_subslice;
        slice as usize * per_slice + subslice as usize * per_subslice + eu as usize * bytes_per_eu
    }

    /// Decodes an attention bitmask into the threads it names.
    pub fn threads_from_bitmask(&self, tile: u32, bitmask: &[u8]) -> Vec<ThreadId> {
        let mut threads = Vec::new();
        let bytes_per_eu = self.bytes_per_eu();

        for slice in 0..self.max_slices {
            for subslice in 0..self.subslices_per_slice {
                for eu in 0..self.attention_eus() {
                    let offset = self.bit_offset(slice, subslice, eu);
                    if offset + bytes_per_eu > bitmask.len() {
                        return threads;
                    }
                    for thread in 0..self.threads_per_eu {
                        let byte = bitmask[offset + thread as usize / 8];
                        if byte & (1 << (thread % 8)) != 0 {
                            threads.push(ThreadId::new(tile, slice, subslice, eu, thread));
                        }
                    }
                }
            }
        }
        threads
    }

    /// Encodes concrete threads into an EU control bitmask.
    pub fn bitmask_from_threads(&self, threads: &[ThreadId]) -> Vec<u8> {
        let mut bitmask = vec![0u8; self.bitmask_size()];
        for id in threads {
            if id.eu >= self.attention_eus() {
                log::warn!("thread {} outside attention EU range, skipped", id);
                continue;
            }
            let offset = self.bit_offset(id.slice, id.subslice, id.eu) + id.thread as usize / 8;
            if offset < bitmask.len() {
                bitmask[offset] |= 1 << (id.thread % 8);
            }
        }
        bitmask
    }
}

/// EU-pair resume erratum: both dwords of each adjacent pair must carry the
/// union of their bits.
pub fn apply_resume_wa(bitmask: &mut [u8]) {
    for pair in bitmask.chunks_exact_mut(8) {
        let a = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let b = u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
        let merged = (a | b).to_le_bytes();
        pair[..4].copy_from_slice(&merged);
        pair[4..].copy_from_slice(&merged);
    }
}
