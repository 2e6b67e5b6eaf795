//! The keyed-map collaborator seam.
//!
//! The core only guarantees that the keys and values it hands an index are
//! well-formed; everything else is the index's own business. One kind is
//! built in, "BXTREE": an ordered map held in memory and persisted as an
//! entry log in the index's own store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use bytemuck::{Pod, Zeroable};

use crate::error::{Result, StoreError};
use crate::ods::Ods;
use crate::{CommitMode, Ref};

/// A persistent ordered map from opaque key bytes to a persistent reference.
pub trait KeyedIndex: Send {
    /// Insert or replace the entry for `key`.
    fn insert(&mut self, key: &[u8], value: Ref) -> Result<()>;
    fn find(&self, key: &[u8]) -> Option<Ref>;
    fn commit(&mut self, mode: CommitMode) -> Result<()>;
}

pub(crate) type SharedIndex = Arc<Mutex<Box<dyn KeyedIndex>>>;

const IDX_SIG: u64 = 0x7865_6469_6465_7331; // "sediidex", sort of

#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct IdxUdata {
    sig: u64,
    order: u32,
    _pad: u32,
    idx_kind: [u8; 16],
    key_kind: [u8; 16],
}

/// Create an index of the named kind at `path`.
pub fn idx_create(
    path: &Path,
    _mode: u32,
    idx_kind: &str,
    key_kind: &str,
    order: usize,
) -> Result<Box<dyn KeyedIndex>> {
    if idx_kind != "BXTREE" {
        return Err(StoreError::Unsupported("unknown index kind"));
    }
    let ods = Ods::open(path)?;
    let udata = ods.user_data();
    udata.write(
        0,
        &IdxUdata {
            sig: IDX_SIG,
            order: order as u32,
            _pad: 0,
            idx_kind: crate::attr::pack_name(idx_kind)?,
            key_kind: crate::attr::pack_name(key_kind)?,
        },
    )?;
    log::debug!("created {idx_kind} index at {path:?}, key kind {key_kind}");
    Ok(Box::new(BxTree {
        ods,
        map: BTreeMap::new(),
    }))
}

/// Open an existing index. Fails when `path` doesn't hold one.
pub fn idx_open(path: &Path) -> Result<Box<dyn KeyedIndex>> {
    if !path.exists() {
        return Err(StoreError::NotFound(path.display().to_string()));
    }
    let ods = Ods::open(path)?;
    let udata: IdxUdata = ods.user_data().read(0)?;
    if udata.sig != IDX_SIG {
        return Err(StoreError::Corrupt("file is not an index store"));
    }
    let mut map = BTreeMap::new();
    let mut bad = false;
    ods.iter(|entry_ref, payload| match parse_entry(payload) {
        Some((key, value)) => {
            map.insert(key.to_vec(), (value, entry_ref));
        }
        None => bad = true,
    })?;
    if bad {
        return Err(StoreError::Corrupt("malformed index entry"));
    }
    Ok(Box::new(BxTree { ods, map }))
}

/// The open-or-create dance the registry runs for attribute indexes.
pub(crate) fn idx_open_or_create(
    path: &Path,
    mode: u32,
    idx_kind: &str,
    key_kind: &str,
    order: usize,
) -> Result<SharedIndex> {
    let idx = match idx_open(path) {
        Ok(idx) => idx,
        Err(StoreError::NotFound(_)) => idx_create(path, mode, idx_kind, key_kind, order)?,
        Err(e) => return Err(e),
    };
    Ok(Arc::new(Mutex::new(idx)))
}

// Entry payload: value ref, key length, key bytes.
fn parse_entry(payload: &[u8]) -> Option<(&[u8], Ref)> {
    if payload.len() < 12 {
        return None;
    }
    let value = LittleEndian::read_u64(&payload[..8]);
    let key_len = LittleEndian::read_u32(&payload[8..12]) as usize;
    payload.get(12..12 + key_len).map(|key| (key, value))
}

struct BxTree {
    ods: Ods,
    /// key → (value ref, ref of the entry object holding it)
    map: BTreeMap<Vec<u8>, (Ref, Ref)>,
}

impl KeyedIndex for BxTree {
    fn insert(&mut self, key: &[u8], value: Ref) -> Result<()> {
        let entry = self.ods.alloc_obj_grow(12 + key.len())?;
        let mut raw = vec![0u8; 12 + key.len()];
        LittleEndian::write_u64(&mut raw[..8], value);
        LittleEndian::write_u32(&mut raw[8..12], key.len() as u32);
        raw[12..].copy_from_slice(key);
        entry.copy_from_slice(0, &raw)?;
        if let Some((_, old_entry)) = self.map.insert(key.to_vec(), (value, entry.ods_ref())) {
            // One entry per key at rest, so replay order can't matter
            self.ods.ref_delete(old_entry)?;
        }
        Ok(())
    }

    fn find(&self, key: &[u8]) -> Option<Ref> {
        self.map.get(key).map(|(value, _)| *value)
    }

    fn commit(&mut self, mode: CommitMode) -> Result<()> {
        self.ods.commit(mode)
    }
}
