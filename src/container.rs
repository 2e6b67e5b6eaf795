//! Containers: a directory holding one record store, one schema store, and
//! the schema name index, plus the in-memory registry trees that make schema
//! lookup fast.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, StoreError};
use crate::index::{idx_open_or_create, SharedIndex};
use crate::ods::{Obj, Ods};
use crate::schema::Schema;
use crate::types::{ObjRef, RecordHeader};
use crate::{CommitMode, Ref};

const SCHEMA_ODS: &str = "schemas.ods";
const SCHEMA_IDX: &str = "schemas.idx";
const OBJECT_ODS: &str = "objects.ods";

const DICT_SIG: u64 = 0x7364_6963_7431_7631; // schema dictionary, v1
/// Fixed slots in the user-data schema dictionary.
const DICT_CAP: u32 = 509;
/// Byte offset of the first dictionary slot within user data.
const DICT_SLOTS: usize = std::mem::size_of::<SchemaUdata>();

/// Header of the schema dictionary kept in the schema store's user data.
/// `DICT_CAP` reference slots follow it; slot `i` holds the reference of the
/// schema record with id `i`, appended on insert.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct SchemaUdata {
    sig: u64,
    dict_len: u32,
    _pad: u32,
}

fn dict_slot(id: u32) -> usize {
    DICT_SLOTS + id as usize * std::mem::size_of::<u64>()
}

struct Registry {
    by_name: BTreeMap<String, Schema>,
    by_id: BTreeMap<u32, Schema>,
    name_idx: SharedIndex,
}

pub(crate) struct ContainerInner {
    path: PathBuf,
    mode: u32,
    schema_ods: Ods,
    obj_ods: Ods,
    registry: Mutex<Registry>,
}

/// An open container. Clones share the same stores and registry.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    pub(crate) fn from_inner(inner: Arc<ContainerInner>) -> Container {
        Container { inner }
    }

    /// Open a container directory, creating it and its stores on first use.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Container> {
        Self::open_mode(path, 0o660)
    }

    /// [`Container::open`] with an explicit creation mode for index files.
    pub fn open_mode<P: AsRef<Path>>(path: P, mode: u32) -> Result<Container> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).map_err(StoreError::Open)?;
        let schema_ods = Ods::open(path.join(SCHEMA_ODS))?;
        let obj_ods = Ods::open(path.join(OBJECT_ODS))?;
        let name_idx =
            idx_open_or_create(&path.join(SCHEMA_IDX), mode, "BXTREE", "STRING", 5)?;

        let udata = schema_ods.user_data();
        let mut ud: SchemaUdata = udata.read(0)?;
        if ud.sig == 0 && ud.dict_len == 0 {
            ud.sig = DICT_SIG;
            udata.write(0, &ud)?;
        } else if ud.sig != DICT_SIG {
            return Err(StoreError::Corrupt("schema dictionary signature mismatch"));
        }

        let container = Container {
            inner: Arc::new(ContainerInner {
                path,
                mode,
                schema_ods,
                obj_ods,
                registry: Mutex::new(Registry {
                    by_name: BTreeMap::new(),
                    by_id: BTreeMap::new(),
                    name_idx,
                }),
            }),
        };

        // Reconstitute every persisted schema through the dictionary
        let mut registry = container.inner.registry.lock().unwrap();
        for id in 0..ud.dict_len {
            let r: Ref = udata.read(dict_slot(id))?;
            let obj = container.inner.schema_ods.ref_as_obj(r)?;
            let schema = Schema::from_obj(&obj)?;
            if schema.id() != id {
                return Err(StoreError::Corrupt("schema dictionary slot disagrees with record"));
            }
            schema.set_container(Arc::downgrade(&container.inner));
            container.open_schema_indexes(&schema)?;
            registry.by_name.insert(schema.name(), schema.clone());
            registry.by_id.insert(id, schema);
        }
        drop(registry);
        log::debug!(
            "opened container {:?} with {} schemas",
            container.inner.path,
            container.schema_count()
        );
        Ok(container)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The store that holds records and their array payloads.
    pub fn obj_ods(&self) -> &Ods {
        &self.inner.obj_ods
    }

    /// Add a schema to the container, assigning its id and freezing it.
    ///
    /// The persistent steps run in a fixed order (schema record, reference
    /// block, name-index entry, dictionary slot) and unwind in strict
    /// reverse order on failure, so a reachable schema is always whole.
    pub fn schema_add(&self, schema: &Schema) -> Result<()> {
        if schema.is_persisted() || schema.is_internal() {
            return Err(StoreError::Busy);
        }
        for attr in schema.attrs() {
            if attr.indexed() && attr.key_kind() == "NONE" {
                return Err(StoreError::Invalid("indexed attribute has no key encoding"));
            }
        }

        let mut registry = self.inner.registry.lock().unwrap();
        let name = schema.name();
        if registry.by_name.contains_key(&name) {
            return Err(StoreError::Exists(name));
        }

        let udata = self.inner.schema_ods.user_data();
        let mut ud: SchemaUdata = udata.read(0)?;
        if ud.dict_len >= DICT_CAP {
            return Err(StoreError::NoMem {
                requested: std::mem::size_of::<Ref>(),
            });
        }
        let id = ud.dict_len;

        let schema_obj = self.inner.schema_ods.alloc_obj_grow(schema.persist_size())?;
        let ref_obj = match self
            .inner
            .schema_ods
            .alloc_obj_grow(std::mem::size_of::<ObjRef>())
        {
            Ok(obj) => obj,
            Err(e) => {
                let _ = schema_obj.delete();
                return Err(e);
            }
        };

        let filled = ref_obj
            .write(
                0,
                &ObjRef {
                    ods_ref: 0,
                    obj_ref: schema_obj.ods_ref(),
                },
            )
            .and_then(|_| schema.persist_into(&schema_obj, id));
        let inserted = filled.and_then(|_| {
            registry
                .name_idx
                .lock()
                .unwrap()
                .insert(name.as_bytes(), ref_obj.ods_ref())
        });
        if let Err(e) = inserted {
            schema.unbind();
            let _ = ref_obj.delete();
            let _ = schema_obj.delete();
            return Err(e);
        }

        udata.write(dict_slot(id), &schema_obj.ods_ref())?;
        ud.dict_len += 1;
        udata.write(0, &ud)?;

        schema.set_container(Arc::downgrade(&self.inner));
        registry.by_name.insert(schema.name(), schema.clone());
        registry.by_id.insert(id, schema.clone());
        drop(registry);

        log::debug!("added schema {:?} with id {id}", schema.name());
        self.open_schema_indexes(schema)
    }

    /// Open (creating on demand) the key-value index of every indexed
    /// attribute of `schema`.
    fn open_schema_indexes(&self, schema: &Schema) -> Result<()> {
        for attr in schema.attrs() {
            if !attr.indexed() {
                continue;
            }
            let path = self
                .inner
                .path
                .join(format!("{}_{}_idx", schema.name(), attr.name()));
            let idx = idx_open_or_create(
                &path,
                self.inner.mode,
                &attr.idx_kind(),
                &attr.key_kind(),
                5,
            )?;
            attr.attach_index(idx);
        }
        Ok(())
    }

    /// Look up a schema by name; the returned handle carries its own
    /// reference.
    pub fn schema_by_name(&self, name: &str) -> Option<Schema> {
        self.inner.registry.lock().unwrap().by_name.get(name).cloned()
    }

    pub fn schema_by_id(&self, id: u32) -> Option<Schema> {
        self.inner.registry.lock().unwrap().by_id.get(&id).cloned()
    }

    /// Number of schemas in the container.
    pub fn schema_count(&self) -> usize {
        self.inner.registry.lock().unwrap().by_name.len()
    }

    /// First schema in name order.
    pub fn schema_first(&self) -> Option<Schema> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .by_name
            .values()
            .next()
            .cloned()
    }

    /// Successor of `schema` in name order.
    pub fn schema_next(&self, schema: &Schema) -> Option<Schema> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .by_name
            .range::<String, _>((Bound::Excluded(schema.name()), Bound::Unbounded))
            .map(|(_, s)| s.clone())
            .next()
    }

    /// Remove a schema from the container.
    pub fn schema_delete(&self, _name: &str) -> Result<()> {
        Err(StoreError::Unsupported("schema deletion"))
    }

    /// Create a record of `schema` in the object store. The record is
    /// zeroed, so every array attribute starts unset.
    pub fn obj_new(&self, schema: &Schema) -> Result<Record> {
        if !schema.is_persisted() || schema.is_internal() {
            return Err(StoreError::Invalid("schema is not a member of a container"));
        }
        let obj = self.inner.obj_ods.alloc_obj_grow(schema.record_size())?;
        obj.with_bytes_mut(|bytes| bytes.fill(0))?;
        obj.write(
            0,
            &RecordHeader {
                schema_id: schema.id(),
                flags: 0,
            },
        )?;
        Ok(Record {
            obj,
            schema: schema.clone(),
        })
    }

    /// Resolve a record reference against its schema, as stamped in the
    /// record header.
    pub fn obj_from_ref(&self, r: Ref) -> Result<Record> {
        let obj = self.inner.obj_ods.ref_as_obj(r)?;
        let header: RecordHeader = obj.read(0)?;
        let schema = self
            .schema_by_id(header.schema_id)
            .ok_or(StoreError::Corrupt("record names an unknown schema"))?;
        Ok(Record { obj, schema })
    }

    /// Free a record's storage, out-of-line array payloads included.
    pub fn obj_delete(&self, record: &Record) -> Result<()> {
        for attr in record.schema.attrs() {
            if !attr.is_array() {
                continue;
            }
            let child: Ref = record.obj.read(attr.offset() as usize)?;
            if child != 0 {
                self.inner.obj_ods.ref_delete(child)?;
            }
        }
        record.obj.delete()
    }

    /// Flush both stores and every open index.
    pub fn commit(&self, mode: CommitMode) -> Result<()> {
        self.inner.schema_ods.commit(mode)?;
        self.inner.obj_ods.commit(mode)?;
        let registry = self.inner.registry.lock().unwrap();
        registry.name_idx.lock().unwrap().commit(mode)?;
        for schema in registry.by_id.values() {
            for attr in schema.attrs() {
                for idx in attr.indexes() {
                    idx.lock().unwrap().commit(mode)?;
                }
            }
        }
        Ok(())
    }

    /// Commit with the given mode and tear down.
    pub fn close(&self, mode: CommitMode) -> Result<()> {
        self.commit(mode)?;
        self.inner.schema_ods.close(mode)?;
        self.inner.obj_ods.close(mode)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("path", &self.inner.path)
            .field("schemas", &self.schema_count())
            .finish()
    }
}

/// A typed record: an object handle paired with the schema that describes
/// its bytes.
#[derive(Clone, Debug)]
pub struct Record {
    obj: Obj,
    schema: Schema,
}

impl Record {
    pub fn obj(&self) -> &Obj {
        &self.obj
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The record's persistent reference.
    pub fn ods_ref(&self) -> Ref {
        self.obj.ods_ref()
    }
}
