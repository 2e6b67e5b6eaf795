use std::fs::File;
use std::path::Path;

use bytemuck::{AnyBitPattern, NoUninit};
use memmap2::{MmapOptions, MmapRaw};

use crate::error::{Result, StoreError};

/// File type tag at the start of every store file.
pub const MAGIC: [u8; 8] = *b"sediment";
/// On-disk format version.
pub const VERSION: u32 = 1;
/// Offset of the reserved user-data region.
pub const UDATA_OFF: u64 = 64;
/// Size of the reserved user-data region.
pub const UDATA_SIZE: usize = 4096;
/// First byte of the heap. Everything below is header plus user data.
pub const HEAP_BASE: u64 = 8192;
/// The minimum size of a store file.
pub const MIN_STORE_SIZE: usize = 64 << 10;

/// Fixed header at offset 0 of every store file.
///
/// `logical_size` and `alloc_root` are rewritten in place as the store grows
/// and allocates; the remaining fields are fixed at creation and covered by
/// `format_hash`.
#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct OdsHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub page_size: u32,
    pub logical_size: u64,
    pub udata_off: u64,
    pub alloc_root: u64,
    pub format_hash: u64,
}

impl OdsHeader {
    fn hash(&self) -> u64 {
        let mut fixed = [0u8; 24];
        fixed[..8].copy_from_slice(&self.magic);
        fixed[8..12].copy_from_slice(&self.version.to_le_bytes());
        fixed[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        fixed[16..24].copy_from_slice(&self.udata_off.to_le_bytes());
        xxhash_rust::xxh3::xxh3_64(&fixed)
    }
}

/// The backing file and its memory map.
///
/// All mutating access is expected to be serialized by the owning store's
/// mutex; this struct only enforces bounds.
pub(crate) struct Mapping {
    map: MmapRaw,
    file: File,
    len: usize,
    created: bool,
}

impl Mapping {
    /// Open a store file, creating and formatting it if it doesn't exist or
    /// is empty. `size` is the initial logical size for a fresh file.
    pub fn open<P: AsRef<Path>>(path: P, size: usize) -> Result<Self> {
        use fs4::fs_std::FileExt;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(StoreError::Open)?;
        file.try_lock_exclusive().map_err(StoreError::Lock)?;

        let file_size = file.metadata().map_err(StoreError::Open)?.len();
        if file_size > (usize::MAX as u64) {
            return Err(StoreError::Corrupt(
                "file is larger than can be memory-mapped on this architecture",
            ));
        }
        let is_new = file_size == 0;
        let page = page_size::get();
        if !page.is_power_of_two() {
            return Err(StoreError::Corrupt("system page size is not a power of two"));
        }

        let len = if is_new {
            let len = round_up(size.max(MIN_STORE_SIZE), page);
            file.set_len(len as u64).map_err(|e| StoreError::ResizeFailed {
                size: 0,
                requested: len,
                source: e,
            })?;
            len
        } else {
            file_size as usize
        };

        let map = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .map_err(|e| StoreError::MapFailed {
                requested: len,
                source: e,
            })?;
        let mut mapping = Self {
            map,
            file,
            len,
            created: is_new,
        };

        if is_new {
            let mut header = OdsHeader {
                magic: MAGIC,
                version: VERSION,
                page_size: page as u32,
                logical_size: len as u64,
                udata_off: UDATA_OFF,
                alloc_root: 0,
                format_hash: 0,
            };
            header.format_hash = header.hash();
            mapping.write(0, &header)?;
            mapping.slice_mut(UDATA_OFF, UDATA_SIZE)?.fill(0);
            log::debug!("formatted new store, {len} bytes, page size {page}");
        } else {
            let header: OdsHeader = mapping.read(0)?;
            if header.magic != MAGIC {
                return Err(StoreError::Corrupt("bad magic in store header"));
            }
            if header.version != VERSION {
                return Err(StoreError::Corrupt("unrecognized version in store header"));
            }
            if header.format_hash != header.hash() {
                return Err(StoreError::Corrupt("store header hash mismatch"));
            }
            if header.udata_off != UDATA_OFF || !header.page_size.is_power_of_two() {
                return Err(StoreError::Corrupt("implausible store header geometry"));
            }
            if header.logical_size > len as u64 {
                return Err(StoreError::Corrupt("store header size exceeds the file"));
            }
            // A torn extend can leave the file longer than the header says;
            // the orphaned tail is reclaimed by the next growth.
            mapping.len = header.logical_size as usize;
        }
        Ok(mapping)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// True when `open` formatted a fresh file rather than validating an
    /// existing one.
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn header(&self) -> Result<OdsHeader> {
        self.read(0)
    }

    pub fn alloc_root(&self) -> Result<u64> {
        Ok(self.header()?.alloc_root)
    }

    pub fn set_alloc_root(&mut self, root: u64) -> Result<()> {
        let mut header = self.header()?;
        header.alloc_root = root;
        self.write(0, &header)
    }

    /// Grow the file by at least `grow` bytes, rounded up to whole pages, and
    /// refresh the mapping. Returns the range of the new region.
    ///
    /// Callers must not hold pointers into the old mapping across this call.
    pub fn extend(&mut self, grow: usize) -> Result<(u64, u64)> {
        let mut header = self.header()?;
        let page = header.page_size as usize;
        let old_len = self.len;
        let new_len = old_len + round_up(grow, page);

        self.file
            .set_len(new_len as u64)
            .map_err(|e| StoreError::ResizeFailed {
                size: old_len,
                requested: new_len,
                source: e,
            })?;
        // Get the new file size into the file's metadata before mapping it
        self.file.sync_all().map_err(StoreError::Sync)?;

        self.remap(new_len)?;
        self.len = new_len;
        header.logical_size = new_len as u64;
        self.write(0, &header)?;
        log::debug!("extended store from {old_len} to {new_len} bytes");
        Ok((old_len as u64, new_len as u64))
    }

    #[cfg(target_os = "linux")]
    fn remap(&mut self, new_len: usize) -> Result<()> {
        use memmap2::RemapOptions;
        // Try to grow the existing map; fall back on a fresh one
        if unsafe { self.map.remap(new_len, RemapOptions::new().may_move(true)) }.is_ok() {
            return Ok(());
        }
        self.fresh_map(new_len)
    }

    #[cfg(not(target_os = "linux"))]
    fn remap(&mut self, new_len: usize) -> Result<()> {
        self.fresh_map(new_len)
    }

    fn fresh_map(&mut self, new_len: usize) -> Result<()> {
        let map = MmapOptions::new()
            .len(new_len)
            .map_raw(&self.file)
            .map_err(|e| StoreError::MapFailed {
                requested: new_len,
                source: e,
            })?;
        self.map = map;
        Ok(())
    }

    /// Flush dirty pages. In sync mode this returns only once the flush is
    /// durable; in async mode the flush is issued and this returns.
    pub fn flush(&self, sync: bool) -> Result<()> {
        if sync {
            self.map.flush().map_err(StoreError::Sync)
        } else {
            self.map.flush_async().map_err(StoreError::Sync)
        }
    }

    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        unsafe {
            Ok(std::slice::from_raw_parts(
                self.map.as_ptr().add(offset as usize),
                len,
            ))
        }
    }

    /// Mutable view of a mapped range.
    ///
    /// Takes `&self` because the map is raw memory; the owning store's mutex
    /// serializes writers, and disjoint reads of immutable regions are safe.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, offset: u64, len: usize) -> Result<&mut [u8]> {
        self.check(offset, len)?;
        unsafe {
            Ok(std::slice::from_raw_parts_mut(
                self.map.as_mut_ptr().add(offset as usize),
                len,
            ))
        }
    }

    /// Read a Pod value at `offset`. Attribute packing makes no alignment
    /// promises, so this always goes through an unaligned read.
    pub fn read<T: AnyBitPattern>(&self, offset: u64) -> Result<T> {
        let bytes = self.slice(offset, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn write<T: NoUninit>(&mut self, offset: u64, value: &T) -> Result<()> {
        let src = bytemuck::bytes_of(value);
        let dst = self.slice_mut(offset, src.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn check(&self, offset: u64, len: usize) -> Result<()> {
        let end = (offset as usize).checked_add(len);
        match end {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(StoreError::InvalidAccess { offset, len }),
        }
    }
}

pub(crate) fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}
