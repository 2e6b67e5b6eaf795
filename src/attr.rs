//! Attribute descriptors: one typed field of a schema, with its persistent
//! form and the per-type operation table bound when the attribute is
//! created.

use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, StoreError};
use crate::index::SharedIndex;
use crate::types::{self, Type, TypeOps};

/// Fixed attribute name storage, trailing nul included.
pub const ATTR_NAME_MAX: usize = 64;

/// Default index kind bound to a new attribute.
pub const DEFAULT_IDX_KIND: &str = "BXTREE";

/// Persistent form of an attribute, packed inline in its schema record.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct AttrData {
    pub name: [u8; ATTR_NAME_MAX],
    pub ty: u32,
    pub id: u32,
    pub offset: u64,
    pub indexed: u8,
    pub _pad: [u8; 7],
}

pub const ATTR_DATA_SIZE: usize = std::mem::size_of::<AttrData>();

/// Pack a name into fixed nul-terminated storage. Rejects names that don't
/// leave room for the terminator.
pub(crate) fn pack_name<const N: usize>(name: &str) -> Result<[u8; N]> {
    if name.len() >= N || name.contains('\0') {
        return Err(StoreError::Invalid("name is too long"));
    }
    let mut out = [0u8; N];
    out[..name.len()].copy_from_slice(name.as_bytes());
    Ok(out)
}

pub(crate) fn unpack_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

struct AttrMeta {
    indexed: bool,
    idx_kind: String,
    key_kind: String,
    /// Open key-value indexes over this attribute
    indexes: Vec<SharedIndex>,
}

struct AttrInner {
    name: String,
    ty: Type,
    id: u32,
    offset: u64,
    ops: &'static TypeOps,
    meta: Mutex<AttrMeta>,
}

/// One field of a schema. Cheaply clonable; the descriptor is immutable once
/// its schema has been persisted.
#[derive(Clone)]
pub struct Attr {
    inner: Arc<AttrInner>,
}

impl Attr {
    /// Create a descriptor with the default index kind and the key type the
    /// type table prescribes. `id` and `offset` come from the schema, which
    /// computes them at append time.
    pub(crate) fn new(name: &str, ty: Type, id: u32, offset: u64) -> Result<Attr> {
        pack_name::<ATTR_NAME_MAX>(name)?;
        Ok(Attr {
            inner: Arc::new(AttrInner {
                name: name.to_owned(),
                ty,
                id,
                offset,
                ops: types::ops_for(ty),
                meta: Mutex::new(AttrMeta {
                    indexed: false,
                    idx_kind: DEFAULT_IDX_KIND.to_owned(),
                    key_kind: types::default_key_type(ty).to_owned(),
                    indexes: Vec::new(),
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ty(&self) -> Type {
        self.inner.ty
    }

    /// Ordinal id: the position in which the attribute was added.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Byte offset of this attribute's storage inside the record, header
    /// included.
    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    /// The in-record footprint in bytes.
    pub fn size(&self) -> usize {
        types::footprint(self.inner.ty)
    }

    pub fn is_ref(&self) -> bool {
        self.inner.ty.is_ref()
    }

    pub fn is_array(&self) -> bool {
        self.inner.ty.is_array()
    }

    pub fn indexed(&self) -> bool {
        self.inner.meta.lock().unwrap().indexed
    }

    pub fn idx_kind(&self) -> String {
        self.inner.meta.lock().unwrap().idx_kind.clone()
    }

    pub fn key_kind(&self) -> String {
        self.inner.meta.lock().unwrap().key_kind.clone()
    }

    pub(crate) fn ops(&self) -> &'static TypeOps {
        self.inner.ops
    }

    pub(crate) fn set_indexed(&self) {
        self.inner.meta.lock().unwrap().indexed = true;
    }

    pub(crate) fn set_index_kinds(&self, idx_kind: &str, key_kind: &str) {
        let mut meta = self.inner.meta.lock().unwrap();
        meta.idx_kind = idx_kind.to_owned();
        meta.key_kind = key_kind.to_owned();
    }

    pub(crate) fn attach_index(&self, idx: SharedIndex) {
        self.inner.meta.lock().unwrap().indexes.push(idx);
    }

    pub(crate) fn indexes(&self) -> Vec<SharedIndex> {
        self.inner.meta.lock().unwrap().indexes.clone()
    }

    pub(crate) fn to_data(&self) -> AttrData {
        let meta = self.inner.meta.lock().unwrap();
        AttrData {
            // Length was validated at construction
            name: pack_name(&self.inner.name).unwrap_or([0; ATTR_NAME_MAX]),
            ty: self.inner.ty as u32,
            id: self.inner.id,
            offset: self.inner.offset,
            indexed: meta.indexed as u8,
            _pad: [0; 7],
        }
    }

    pub(crate) fn from_data(data: &AttrData) -> Result<Attr> {
        let ty = Type::from_u32(data.ty)
            .ok_or(StoreError::Corrupt("unknown attribute type tag"))?;
        let attr = Attr::new(&unpack_name(&data.name), ty, data.id, data.offset)?;
        if data.indexed != 0 {
            attr.set_indexed();
        }
        Ok(attr)
    }
}

impl std::fmt::Debug for Attr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attr")
            .field("name", &self.inner.name)
            .field("type", &self.inner.ty)
            .field("id", &self.inner.id)
            .field("offset", &self.inner.offset)
            .field("indexed", &self.indexed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_type() {
        let a = Attr::new("ts", Type::Timestamp, 0, 8).unwrap();
        assert_eq!(a.idx_kind(), "BXTREE");
        assert_eq!(a.key_kind(), "UINT64");
        assert!(!a.indexed());
        assert!(!a.is_ref());

        let b = Attr::new("tags", Type::ByteArray, 1, 16).unwrap();
        assert_eq!(b.key_kind(), "STRING");
        assert!(b.is_ref());
        assert!(b.is_array());
    }

    #[test]
    fn name_limit_is_enforced() {
        let long = "x".repeat(ATTR_NAME_MAX);
        assert!(Attr::new(&long, Type::Int32, 0, 8).is_err());
        let ok = "x".repeat(ATTR_NAME_MAX - 1);
        assert!(Attr::new(&ok, Type::Int32, 0, 8).is_ok());
    }

    #[test]
    fn persistent_form_round_trips() {
        let a = Attr::new("Salary", Type::Float, 2, 20).unwrap();
        a.set_indexed();
        let data = a.to_data();
        assert_eq!(std::mem::size_of::<AttrData>(), ATTR_DATA_SIZE);
        let b = Attr::from_data(&data).unwrap();
        assert_eq!(b.name(), "Salary");
        assert_eq!(b.ty(), Type::Float);
        assert_eq!(b.id(), 2);
        assert_eq!(b.offset(), 20);
        assert!(b.indexed());
    }
}
