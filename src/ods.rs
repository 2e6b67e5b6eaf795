//! The object data store: a growable memory-mapped heap of persistent
//! objects identified by stable byte offsets, plus the reference-counted
//! in-memory handles that view them.

use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytemuck::{AnyBitPattern, NoUninit};

use crate::alloc;
use crate::error::{Result, StoreError};
use crate::mapping::{Mapping, HEAP_BASE, UDATA_OFF, UDATA_SIZE};
use crate::{CommitMode, Ref};

/// Smallest amount a failed allocation grows the store by; the grow-retry
/// wrapper extends by `max(request, EXTEND_MIN) * 16`.
pub const EXTEND_MIN: usize = 64 << 10;

/// Builder for opening or creating a store file.
#[derive(Clone, Debug)]
pub struct OdsOptions {
    size: usize,
}

impl Default for OdsOptions {
    fn default() -> Self {
        Self { size: 0 }
    }
}

impl OdsOptions {
    /// Set the initial logical size for a freshly created store. Ignored
    /// when the file already exists. Clamped up to the store minimum.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Ods> {
        let path = path.as_ref().to_path_buf();
        let mut map = Mapping::open(&path, self.size)?;
        if map.was_created() {
            alloc::init(&mut map)?;
        }
        log::debug!("opened store {:?}, {} bytes", path, map.len());
        Ok(Ods {
            inner: Arc::new(OdsInner {
                path,
                state: Mutex::new(OdsState { map, extends: 0 }),
                live: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct OdsState {
    map: Mapping,
    /// Number of times this store has grown since open
    extends: u64,
}

struct OdsInner {
    path: PathBuf,
    state: Mutex<OdsState>,
    /// Weak registry of live object handles, for diagnostics
    live: Mutex<Vec<Weak<ObjInner>>>,
}

/// One object data store: a shared handle onto a mapped file. Clones share
/// the underlying store; the file unmaps when the last clone drops.
#[derive(Clone)]
pub struct Ods {
    inner: Arc<OdsInner>,
}

impl Ods {
    /// Open `path` with default options, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Ods> {
        OdsOptions::default().open(path)
    }

    pub fn options() -> OdsOptions {
        OdsOptions::default()
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Current logical size of the store in bytes.
    pub fn size(&self) -> usize {
        self.inner.state.lock().unwrap().map.len()
    }

    /// How many times the store has grown since it was opened.
    pub fn extend_count(&self) -> u64 {
        self.inner.state.lock().unwrap().extends
    }

    /// Allocate an object of at least `size` bytes. Does not grow the store;
    /// see [`Ods::alloc_obj_grow`] for the grow-and-retry path.
    #[track_caller]
    pub fn alloc_obj(&self, size: usize) -> Result<Obj> {
        let site = Location::caller();
        let mut st = self.inner.state.lock().unwrap();
        let r = alloc::alloc(&mut st.map, size)?;
        let size = alloc::payload_size(&st.map, r)?;
        drop(st);
        Ok(self.handle(r, size, site))
    }

    /// Allocate an object of at least `size` bytes, growing the store once
    /// if the heap is full. The second failure surfaces unchanged.
    #[track_caller]
    pub fn alloc_obj_grow(&self, size: usize) -> Result<Obj> {
        let site = Location::caller();
        let mut st = self.inner.state.lock().unwrap();
        let r = match alloc::alloc(&mut st.map, size) {
            Ok(r) => r,
            Err(StoreError::NoMem { .. }) => {
                let grow = size.max(EXTEND_MIN) * 16;
                let (start, end) = st.map.extend(grow)?;
                st.extends += 1;
                alloc::extend_free(&mut st.map, start, end)?;
                alloc::alloc(&mut st.map, size)?
            }
            Err(e) => return Err(e),
        };
        let size = alloc::payload_size(&st.map, r)?;
        drop(st);
        Ok(self.handle(r, size, site))
    }

    /// Resolve an existing reference into a new handle. Fails when the
    /// reference is null or doesn't point at an allocated object.
    #[track_caller]
    pub fn ref_as_obj(&self, r: Ref) -> Result<Obj> {
        if r == 0 {
            return Err(StoreError::Invalid("null reference"));
        }
        let site = Location::caller();
        let st = self.inner.state.lock().unwrap();
        let size = alloc::payload_size(&st.map, r)?;
        drop(st);
        Ok(self.handle(r, size, site))
    }

    /// Free the storage behind a reference without going through a handle.
    pub fn ref_delete(&self, r: Ref) -> Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        alloc::free(&mut st.map, r)
    }

    /// Handle onto the reserved user-data region. Store-global metadata
    /// lives here; the region is outside the heap and cannot be deleted.
    #[track_caller]
    pub fn user_data(&self) -> Obj {
        self.handle(UDATA_OFF, UDATA_SIZE, Location::caller())
    }

    /// Grow the store by at least `grow` bytes and hand the new space to the
    /// allocator.
    pub fn extend(&self, grow: usize) -> Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        let (start, end) = st.map.extend(grow)?;
        st.extends += 1;
        alloc::extend_free(&mut st.map, start, end)
    }

    /// Walk every allocated object in address order. Must not be called
    /// while another thread mutates the store.
    pub fn iter(&self, f: impl FnMut(Ref, &[u8])) -> Result<()> {
        let st = self.inner.state.lock().unwrap();
        alloc::for_each(&st.map, f)
    }

    /// Flush dirty pages. [`CommitMode::Sync`] waits for durability;
    /// [`CommitMode::Async`] issues the flush and returns.
    pub fn commit(&self, mode: CommitMode) -> Result<()> {
        let st = self.inner.state.lock().unwrap();
        st.map.flush(mode == CommitMode::Sync)
    }

    /// Commit with the given mode and tear down. The mapping itself is
    /// released when the last clone of this store drops.
    pub fn close(&self, mode: CommitMode) -> Result<()> {
        self.commit(mode)?;
        let live = self.live_handles();
        if live > 0 {
            log::warn!("closing store {:?} with {live} live object handles", self.inner.path);
        }
        Ok(())
    }

    /// Number of live object handles onto this store.
    pub fn live_handles(&self) -> usize {
        let mut live = self.inner.live.lock().unwrap();
        live.retain(|w| w.strong_count() > 0);
        live.len()
    }

    /// Print the store's meta data: sizes, heap accounting, live handles.
    pub fn dump(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        let (used, used_bytes, free, free_bytes) = {
            let st = self.inner.state.lock().unwrap();
            alloc::stats(&st.map).map_err(std::io::Error::other)?
        };
        writeln!(out, "store     : {:?}", self.inner.path)?;
        writeln!(out, "size      : {}", self.size())?;
        writeln!(out, "allocated : {used} blocks, {used_bytes} bytes")?;
        writeln!(out, "free      : {free} blocks, {free_bytes} bytes")?;
        writeln!(out, "handles   : {}", self.live_handles())
    }

    fn handle(&self, r: Ref, size: usize, site: &'static Location<'static>) -> Obj {
        let inner = Arc::new(ObjInner {
            ods: self.clone(),
            r: AtomicU64::new(r),
            size,
            alloc_site: site,
        });
        self.inner.live.lock().unwrap().push(Arc::downgrade(&inner));
        Obj { inner }
    }
}

impl std::fmt::Debug for Ods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ods")
            .field("path", &self.inner.path)
            .field("size", &self.size())
            .finish()
    }
}

struct ObjInner {
    ods: Ods,
    /// Persistent reference; zeroed once the storage is deleted
    r: AtomicU64,
    /// Allocated payload size
    size: usize,
    /// Where this handle was created, for leak diagnostics
    alloc_site: &'static Location<'static>,
}

/// A reference-counted in-memory view of one persistent object.
///
/// Cloning takes a reference; dropping releases one. The handle stores the
/// persistent reference rather than a raw pointer, and resolves it against
/// the current mapping on each access, so handles stay valid across store
/// growth. Dropping a handle never touches persistent storage; use
/// [`Obj::delete`] for that.
#[derive(Clone)]
pub struct Obj {
    inner: Arc<ObjInner>,
}

impl Obj {
    pub fn ods(&self) -> &Ods {
        &self.inner.ods
    }

    /// The persistent reference. Zero after [`Obj::delete`].
    pub fn ods_ref(&self) -> Ref {
        self.inner.r.load(Ordering::Acquire)
    }

    /// Allocated payload size in bytes.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Where this handle was created.
    pub fn alloc_site(&self) -> &'static Location<'static> {
        self.inner.alloc_site
    }

    /// Borrow the object's bytes for the duration of the closure. The
    /// borrow is scoped under the store lock, so the mapping cannot move
    /// while it is held.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let r = self.live_ref()?;
        let st = self.inner.ods.inner.state.lock().unwrap();
        Ok(f(st.map.slice(r, self.inner.size)?))
    }

    /// Mutable variant of [`Obj::with_bytes`].
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let r = self.live_ref()?;
        let st = self.inner.ods.inner.state.lock().unwrap();
        Ok(f(st.map.slice_mut(r, self.inner.size)?))
    }

    /// Read a Pod value at a byte offset within the object.
    pub fn read<T: AnyBitPattern>(&self, off: usize) -> Result<T> {
        self.with_bytes(|b| {
            b.get(off..off + std::mem::size_of::<T>())
                .map(bytemuck::pod_read_unaligned)
        })?
        .ok_or(StoreError::InvalidAccess {
            offset: self.ods_ref(),
            len: off + std::mem::size_of::<T>(),
        })
    }

    /// Write a Pod value at a byte offset within the object.
    pub fn write<T: NoUninit>(&self, off: usize, value: &T) -> Result<()> {
        let src = bytemuck::bytes_of(value);
        self.copy_from_slice(off, src)
    }

    pub fn copy_from_slice(&self, off: usize, src: &[u8]) -> Result<()> {
        let ok = self.with_bytes_mut(|b| match b.get_mut(off..off + src.len()) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        })?;
        if ok {
            Ok(())
        } else {
            Err(StoreError::InvalidAccess {
                offset: self.ods_ref(),
                len: off + src.len(),
            })
        }
    }

    /// Free the object's storage in the store and zero this handle's
    /// reference. The in-memory handle itself is released by dropping.
    pub fn delete(&self) -> Result<()> {
        let r = self.live_ref()?;
        if r < HEAP_BASE {
            return Err(StoreError::Invalid("cannot delete the user-data region"));
        }
        let mut st = self.inner.ods.inner.state.lock().unwrap();
        alloc::free(&mut st.map, r)?;
        self.inner.r.store(0, Ordering::Release);
        Ok(())
    }

    fn live_ref(&self) -> Result<Ref> {
        match self.inner.r.load(Ordering::Acquire) {
            0 => Err(StoreError::Invalid("object storage was deleted")),
            r => Ok(r),
        }
    }
}

impl std::fmt::Debug for Obj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Obj")
            .field("ref", &self.ods_ref())
            .field("size", &self.inner.size)
            .field("alloc_site", &self.inner.alloc_site)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Ods) {
        let dir = tempfile::tempdir().unwrap();
        let ods = Ods::open(dir.path().join("t.ods")).unwrap();
        (dir, ods)
    }

    #[test]
    fn alloc_resolve_equality() {
        let (_dir, ods) = store();
        let obj = ods.alloc_obj(100).unwrap();
        obj.write(0, &0xfeed_u64).unwrap();
        let again = ods.ref_as_obj(obj.ods_ref()).unwrap();
        assert_eq!(again.ods_ref(), obj.ods_ref());
        assert_eq!(again.size(), obj.size());
        assert_eq!(again.read::<u64>(0).unwrap(), 0xfeed);
    }

    #[test]
    fn null_and_wild_refs_rejected() {
        let (_dir, ods) = store();
        assert!(ods.ref_as_obj(0).is_err());
        assert!(ods.ref_as_obj(HEAP_BASE + 8).is_err());
        assert!(ods.ref_as_obj(u64::MAX).is_err());
    }

    #[test]
    fn refcount_follows_clones() {
        let (_dir, ods) = store();
        let obj = ods.alloc_obj(16).unwrap();
        let c1 = obj.clone();
        let c2 = c1.clone();
        assert_eq!(ods.live_handles(), 1);
        drop(obj);
        drop(c1);
        assert_eq!(ods.live_handles(), 1);
        drop(c2);
        assert_eq!(ods.live_handles(), 0);
    }

    #[test]
    fn delete_zeroes_the_reference() {
        let (_dir, ods) = store();
        let obj = ods.alloc_obj(64).unwrap();
        let clone = obj.clone();
        obj.delete().unwrap();
        assert_eq!(obj.ods_ref(), 0);
        assert_eq!(clone.ods_ref(), 0);
        assert!(obj.with_bytes(|_| ()).is_err());
        assert!(obj.delete().is_err());
    }

    #[test]
    fn user_data_persists_and_refuses_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.ods");
        {
            let ods = Ods::open(&path).unwrap();
            let ud = ods.user_data();
            ud.write(0, &0xabad1dea_u64).unwrap();
            assert!(ud.delete().is_err());
            ods.close(CommitMode::Sync).unwrap();
        }
        let ods = Ods::open(&path).unwrap();
        assert_eq!(ods.user_data().read::<u64>(0).unwrap(), 0xabad1dea);
    }

    #[test]
    fn grow_retry_extends_once() {
        let (_dir, ods) = store();
        let mut objs = Vec::new();
        loop {
            match ods.alloc_obj(4096 - 16) {
                Ok(o) => objs.push(o),
                Err(StoreError::NoMem { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ods.extend_count(), 0);
        let obj = ods.alloc_obj_grow(4096 - 16).unwrap();
        assert_eq!(ods.extend_count(), 1);
        assert!(obj.ods_ref() != 0);
    }

    #[test]
    fn iter_walks_live_objects() {
        let (_dir, ods) = store();
        let a = ods.alloc_obj(32).unwrap();
        let b = ods.alloc_obj(32).unwrap();
        b.delete().unwrap();
        let c = ods.alloc_obj(32).unwrap();
        let mut refs = Vec::new();
        ods.iter(|r, bytes| {
            assert_eq!(bytes.len(), 32);
            refs.push(r);
        })
        .unwrap();
        assert!(refs.contains(&a.ods_ref()));
        assert!(refs.contains(&c.ods_ref()));
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn dump_reports_accounting() {
        let (_dir, ods) = store();
        let _obj = ods.alloc_obj(64).unwrap();
        let mut out = Vec::new();
        ods.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("allocated : 1 blocks"));
    }
}
