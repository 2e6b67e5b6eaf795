//! Schemas: named, attribute-ordered descriptions of a record type.
//!
//! A schema is mutable until it is added to a container; from then on the
//! persistent form is authoritative and the descriptor is frozen. Ten
//! internal schemas, one per reference-carrying type, describe the layout of
//! out-of-line array payloads and are never added to any container.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytemuck::{Pod, Zeroable};

use crate::attr::{pack_name, unpack_name, Attr, AttrData, ATTR_DATA_SIZE};
use crate::container::{Container, ContainerInner};
use crate::error::{Result, StoreError};
use crate::ods::Obj;
use crate::types::{self, Type, RECORD_HDR};

/// Fixed schema name storage, trailing nul included.
pub const SCHEMA_NAME_MAX: usize = 64;

/// Internal schemas carry reserved ids well above anything a container's
/// dictionary can assign; each gets a unique one.
pub const ISCHEMA_ID_BASE: u32 = 0xFFFF_FF00;

/// Persistent form of a schema. The schema record is this header followed by
/// `attr_cnt` packed [`AttrData`] entries.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct SchemaData {
    pub name: [u8; SCHEMA_NAME_MAX],
    pub id: u32,
    pub ref_count: u32,
    pub schema_sz: u32,
    pub obj_sz: u32,
    pub attr_cnt: u32,
    pub key_sz: u32,
}

pub const SCHEMA_DATA_SIZE: usize = std::mem::size_of::<SchemaData>();

struct SchemaCore {
    name: String,
    id: u32,
    /// Record size, header included
    obj_sz: u32,
    /// Largest attribute footprint; the key buffer bound for the index layer
    key_sz: u32,
    /// Insertion order; attribute ids are ordinals, so this doubles as the
    /// id dictionary
    attrs: Vec<Attr>,
    /// Handle to the persistent schema record; `Some` means frozen
    obj: Option<Obj>,
    /// The container this schema belongs to, if any
    container: Weak<ContainerInner>,
}

struct SchemaInner {
    internal: bool,
    core: Mutex<SchemaCore>,
}

/// A schema handle. Clones share the descriptor and act as references;
/// dropping the last clone releases the in-memory form only.
#[derive(Clone)]
pub struct Schema {
    inner: Arc<SchemaInner>,
}

impl Schema {
    /// Create a fresh, mutable schema. Fails when the name exceeds the fixed
    /// limit.
    pub fn new(name: &str) -> Result<Schema> {
        pack_name::<SCHEMA_NAME_MAX>(name)?;
        Ok(Self::with_core(
            false,
            SchemaCore {
                name: name.to_owned(),
                id: 0,
                obj_sz: RECORD_HDR as u32,
                key_sz: 0,
                attrs: Vec::new(),
                obj: None,
                container: Weak::new(),
            },
        ))
    }

    fn with_core(internal: bool, core: SchemaCore) -> Schema {
        Schema {
            inner: Arc::new(SchemaInner {
                internal,
                core: Mutex::new(core),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.core.lock().unwrap().name.clone()
    }

    /// The container-assigned numeric id; meaningless until the schema has
    /// been added.
    pub fn id(&self) -> u32 {
        self.inner.core.lock().unwrap().id
    }

    /// Size of a record of this schema, header included.
    pub fn record_size(&self) -> usize {
        self.inner.core.lock().unwrap().obj_sz as usize
    }

    /// Largest attribute footprint, a bound on index key sizes.
    pub fn max_key_size(&self) -> usize {
        self.inner.core.lock().unwrap().key_sz as usize
    }

    pub fn attr_count(&self) -> usize {
        self.inner.core.lock().unwrap().attrs.len()
    }

    pub fn is_internal(&self) -> bool {
        self.inner.internal
    }

    /// The container this schema has been added to, if it is still open.
    pub fn container(&self) -> Option<Container> {
        self.inner
            .core
            .lock()
            .unwrap()
            .container
            .upgrade()
            .map(Container::from_inner)
    }

    pub(crate) fn set_container(&self, container: Weak<ContainerInner>) {
        self.inner.core.lock().unwrap().container = container;
    }

    /// Whether the schema has been added to a container and is frozen.
    pub fn is_persisted(&self) -> bool {
        self.inner.core.lock().unwrap().obj.is_some()
    }

    /// Append an attribute. The offset is the previous attribute's offset
    /// plus its footprint, or the record header size for the first one.
    pub fn attr_add(&self, name: &str, ty: Type) -> Result<()> {
        let mut core = self.lock_mutable()?;
        if core.attrs.iter().any(|a| a.name() == name) {
            return Err(StoreError::Exists(name.to_owned()));
        }
        let offset = match core.attrs.last() {
            Some(prev) => prev.offset() + prev.size() as u64,
            None => RECORD_HDR as u64,
        };
        let attr = Attr::new(name, ty, core.attrs.len() as u32, offset)?;
        core.key_sz = core.key_sz.max(attr.size() as u32);
        core.obj_sz = (offset + attr.size() as u64) as u32;
        core.attrs.push(attr);
        Ok(())
    }

    /// Mark the named attribute as indexed. The index itself is created when
    /// the schema is added to a container.
    pub fn index_add(&self, name: &str) -> Result<()> {
        let core = self.lock_mutable()?;
        let attr = core
            .attrs
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        attr.set_indexed();
        Ok(())
    }

    /// Override the named attribute's index kind and key kind.
    pub fn index_modify(&self, name: &str, idx_kind: &str, key_kind: &str) -> Result<()> {
        let core = self.lock_mutable()?;
        let attr = core
            .attrs
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        attr.set_index_kinds(idx_kind, key_kind);
        Ok(())
    }

    fn lock_mutable(&self) -> Result<std::sync::MutexGuard<'_, SchemaCore>> {
        if self.inner.internal {
            return Err(StoreError::Busy);
        }
        let core = self.inner.core.lock().unwrap();
        if core.obj.is_some() {
            return Err(StoreError::Busy);
        }
        Ok(core)
    }

    pub fn attr_by_name(&self, name: &str) -> Option<Attr> {
        self.inner
            .core
            .lock()
            .unwrap()
            .attrs
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    /// O(1): attribute ids are ordinals into the insertion-ordered sequence.
    pub fn attr_by_id(&self, id: u32) -> Option<Attr> {
        self.inner.core.lock().unwrap().attrs.get(id as usize).cloned()
    }

    /// Snapshot of the attributes in insertion order.
    pub fn attrs(&self) -> Vec<Attr> {
        self.inner.core.lock().unwrap().attrs.clone()
    }

    /// Bytes the persistent schema record needs.
    pub fn persist_size(&self) -> usize {
        SCHEMA_DATA_SIZE + self.attr_count() * ATTR_DATA_SIZE
    }

    /// Write the schema into its freshly allocated record and freeze it.
    pub(crate) fn persist_into(&self, obj: &Obj, id: u32) -> Result<()> {
        let mut core = self.inner.core.lock().unwrap();
        if core.obj.is_some() {
            return Err(StoreError::Busy);
        }
        let data = SchemaData {
            name: pack_name(&core.name)?,
            id,
            ref_count: 0,
            schema_sz: (SCHEMA_DATA_SIZE + core.attrs.len() * ATTR_DATA_SIZE) as u32,
            obj_sz: core.obj_sz,
            attr_cnt: core.attrs.len() as u32,
            key_sz: core.key_sz,
        };
        obj.write(0, &data)?;
        for (i, attr) in core.attrs.iter().enumerate() {
            obj.write(SCHEMA_DATA_SIZE + i * ATTR_DATA_SIZE, &attr.to_data())?;
        }
        core.id = id;
        core.obj = Some(obj.clone());
        Ok(())
    }

    /// Rollback half of [`Schema::persist_into`], for unwinding a failed add.
    pub(crate) fn unbind(&self) {
        let mut core = self.inner.core.lock().unwrap();
        core.obj = None;
        core.id = 0;
        core.container = Weak::new();
    }

    /// Reconstitute the in-memory skeleton of an already-persisted schema
    /// record, the reverse of [`Schema::persist_into`].
    pub(crate) fn from_obj(obj: &Obj) -> Result<Schema> {
        let data: SchemaData = obj.read(0)?;
        let attr_cnt = data.attr_cnt as usize;
        if SCHEMA_DATA_SIZE + attr_cnt * ATTR_DATA_SIZE > obj.size() {
            return Err(StoreError::Corrupt("schema record is too small for its attributes"));
        }
        let mut attrs = Vec::with_capacity(attr_cnt);
        for i in 0..attr_cnt {
            let raw: AttrData = obj.read(SCHEMA_DATA_SIZE + i * ATTR_DATA_SIZE)?;
            let attr = Attr::from_data(&raw)?;
            if attr.id() as usize != i {
                return Err(StoreError::Corrupt("attribute ids are not ordinal"));
            }
            attrs.push(attr);
        }
        Ok(Self::with_core(
            false,
            SchemaCore {
                name: unpack_name(&data.name),
                id: data.id,
                obj_sz: data.obj_sz,
                key_sz: data.key_sz,
                attrs,
                obj: Some(obj.clone()),
                container: Weak::new(),
            },
        ))
    }

    /// A mutable, unattached copy: fresh reference count, copied attribute
    /// list, no persistent record.
    pub fn dup(&self) -> Result<Schema> {
        let core = self.inner.core.lock().unwrap();
        let mut attrs = Vec::with_capacity(core.attrs.len());
        for src in &core.attrs {
            let attr = Attr::new(src.name(), src.ty(), src.id(), src.offset())?;
            if src.indexed() {
                attr.set_indexed();
            }
            attr.set_index_kinds(&src.idx_kind(), &src.key_kind());
            attrs.push(attr);
        }
        Ok(Self::with_core(
            false,
            SchemaCore {
                name: core.name.clone(),
                id: core.id,
                obj_sz: core.obj_sz,
                key_sz: core.key_sz,
                attrs,
                obj: None,
                container: Weak::new(),
            },
        ))
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock().unwrap();
        f.debug_struct("Schema")
            .field("name", &core.name)
            .field("id", &core.id)
            .field("obj_sz", &core.obj_sz)
            .field("attrs", &core.attrs.len())
            .field("persisted", &core.obj.is_some())
            .finish()
    }
}

impl std::fmt::Display for Schema {
    /// The schema definition in YAML form.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock().unwrap();
        writeln!(f, "schema :")?;
        writeln!(f, "    name      : {}", core.name)?;
        writeln!(
            f,
            "    schema_sz : {}",
            SCHEMA_DATA_SIZE + core.attrs.len() * ATTR_DATA_SIZE
        )?;
        writeln!(f, "    obj_sz    : {}", core.obj_sz)?;
        writeln!(f, "    id        : {}", core.id)?;
        for attr in &core.attrs {
            writeln!(f, "    -attribute : {}", attr.name())?;
            writeln!(f, "        type          : {}", types::type_name(attr.ty()))?;
            writeln!(f, "        idx           : {}", attr.id())?;
            writeln!(f, "        indexed       : {}", attr.indexed() as u8)?;
            writeln!(f, "        offset        : {}", attr.offset())?;
        }
        Ok(())
    }
}

/// One entry of a schema template.
#[derive(Clone, Copy, Debug)]
pub struct AttrTemplate<'a> {
    pub name: &'a str,
    pub ty: Type,
    pub indexed: bool,
}

/// Declarative schema description for [`schema_from_template`].
#[derive(Clone, Copy, Debug)]
pub struct SchemaTemplate<'a> {
    pub name: &'a str,
    pub attrs: &'a [AttrTemplate<'a>],
}

/// Build a schema from a template: `Schema::new` plus one `attr_add` per
/// entry, with an `index_add` where `indexed` is set. Nothing survives an
/// error; the partial schema is dropped whole.
pub fn schema_from_template(t: &SchemaTemplate) -> Result<Schema> {
    let schema = Schema::new(t.name)?;
    for attr in t.attrs {
        schema.attr_add(attr.name, attr.ty)?;
        if attr.indexed {
            schema.index_add(attr.name)?;
        }
    }
    Ok(schema)
}

fn ischema(ty: Type) -> Schema {
    let name = match ty {
        Type::Obj => "ISCHEMA_OBJ".to_owned(),
        other => types::type_name(other).to_owned(),
    };
    Schema::with_core(
        true,
        SchemaCore {
            name,
            id: ISCHEMA_ID_BASE + ty as u32,
            // The element size, not a multiple of any count
            obj_sz: types::element_size(ty) as u32,
            key_sz: 0,
            attrs: Vec::new(),
            obj: None,
            container: Weak::new(),
        },
    )
}

/// The fixed internal schema describing the out-of-line payload of a
/// reference-carrying type. Statically initialized, never freed, never added
/// to a container.
pub fn get_ischema(ty: Type) -> Result<Schema> {
    static ISCHEMAS: OnceLock<Vec<Schema>> = OnceLock::new();
    if !ty.is_ref() {
        return Err(StoreError::Invalid("primitive types have no internal schema"));
    }
    let table = ISCHEMAS.get_or_init(|| {
        (Type::Obj as u32..types::TYPE_COUNT as u32)
            .map(|tag| ischema(Type::from_u32(tag).unwrap()))
            .collect()
    });
    Ok(table[ty as usize - Type::Obj as usize].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_pack_in_declaration_order() {
        let s = Schema::new("mixed").unwrap();
        s.attr_add("a", Type::Int32).unwrap();
        s.attr_add("b", Type::Int64).unwrap();
        s.attr_add("c", Type::ByteArray).unwrap();
        let offsets: Vec<u64> = s.attrs().iter().map(|a| a.offset()).collect();
        assert_eq!(offsets, vec![8, 12, 20]);
        // The array is stored as an 8-byte reference
        assert_eq!(s.record_size(), 28);
        assert_eq!(s.max_key_size(), 8);
    }

    #[test]
    fn attribute_offsets_stay_inside_the_record() {
        let s = Schema::new("bounds").unwrap();
        for (i, ty) in [Type::Float, Type::LongDouble, Type::Timestamp, Type::Obj]
            .iter()
            .enumerate()
        {
            s.attr_add(&format!("a{i}"), *ty).unwrap();
        }
        let mut prev = 0;
        for a in s.attrs() {
            assert!(a.offset() as usize + a.size() <= s.record_size());
            assert!(a.offset() > prev || prev == 0);
            prev = a.offset();
        }
    }

    #[test]
    fn duplicate_and_lookup_rules() {
        let s = Schema::new("dups").unwrap();
        s.attr_add("x", Type::Int32).unwrap();
        assert!(matches!(
            s.attr_add("x", Type::Int64),
            Err(StoreError::Exists(_))
        ));
        assert!(s.attr_by_name("x").is_some());
        assert!(s.attr_by_name("y").is_none());
        assert_eq!(s.attr_by_id(0).unwrap().name(), "x");
        assert!(s.attr_by_id(1).is_none());
        assert!(matches!(s.index_add("y"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn name_boundaries() {
        assert!(Schema::new("").is_ok());
        assert!(Schema::new(&"n".repeat(SCHEMA_NAME_MAX)).is_err());
        assert!(Schema::new(&"n".repeat(SCHEMA_NAME_MAX - 1)).is_ok());
    }

    #[test]
    fn template_builds_whole_schema() {
        let s = schema_from_template(&SchemaTemplate {
            name: "employee",
            attrs: &[
                AttrTemplate {
                    name: "First",
                    ty: Type::ByteArray,
                    indexed: true,
                },
                AttrTemplate {
                    name: "Salary",
                    ty: Type::Float,
                    indexed: false,
                },
            ],
        })
        .unwrap();
        assert_eq!(s.attr_count(), 2);
        assert!(s.attr_by_name("First").unwrap().indexed());
        assert!(!s.attr_by_name("Salary").unwrap().indexed());

        // A bad entry drops the whole schema
        assert!(schema_from_template(&SchemaTemplate {
            name: "bad",
            attrs: &[
                AttrTemplate {
                    name: "a",
                    ty: Type::Int32,
                    indexed: false,
                },
                AttrTemplate {
                    name: "a",
                    ty: Type::Int32,
                    indexed: false,
                },
            ],
        })
        .is_err());
    }

    #[test]
    fn dup_is_mutable_again() {
        let s = schema_from_template(&SchemaTemplate {
            name: "orig",
            attrs: &[AttrTemplate {
                name: "k",
                ty: Type::Uint64,
                indexed: true,
            }],
        })
        .unwrap();
        let d = s.dup().unwrap();
        assert_eq!(d.name(), "orig");
        assert_eq!(d.attr_count(), 1);
        assert!(d.attr_by_name("k").unwrap().indexed());
        assert!(!d.is_persisted());
        d.attr_add("extra", Type::Double).unwrap();
        assert_eq!(s.attr_count(), 1);
    }

    #[test]
    fn internal_schemas_are_fixed_and_unique() {
        let mut seen = std::collections::BTreeSet::new();
        for tag in Type::Obj as u32..crate::types::TYPE_COUNT as u32 {
            let ty = Type::from_u32(tag).unwrap();
            let is = get_ischema(ty).unwrap();
            assert!(is.is_internal());
            assert_eq!(is.record_size(), crate::types::element_size(ty));
            assert!(seen.insert(is.id()), "duplicate internal schema id");
            assert!(matches!(is.attr_add("x", Type::Int32), Err(StoreError::Busy)));
        }
        assert_eq!(seen.len(), 10);
        assert!(get_ischema(Type::Int32).is_err());
    }

    #[test]
    fn display_prints_yaml_shape() {
        let s = Schema::new("P").unwrap();
        s.attr_add("t", Type::Timestamp).unwrap();
        let text = s.to_string();
        assert!(text.starts_with("schema :"));
        assert!(text.contains("name      : P"));
        assert!(text.contains("type          : TIMESTAMP"));
    }
}
