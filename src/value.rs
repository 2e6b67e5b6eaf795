//! Value views: short-lived bindings of (record, attribute) used to read and
//! write one attribute. Primitive attributes resolve to their in-record
//! bytes; array attributes follow the stored reference to their out-of-line
//! payload and bind that instead.

use byteorder::{ByteOrder, LittleEndian};

use crate::attr::Attr;
use crate::container::Record;
use crate::error::{Result, StoreError};
use crate::ods::Obj;
use crate::schema::get_ischema;
use crate::types::{RecordHeader, Type, RECORD_HDR};
use crate::Ref;

/// Largest primitive footprint, the bound for memory-only buffers.
const MEM_VALUE_MAX: usize = 16;

enum Backing {
    /// Bound into a store: the object and the byte offset of the value data
    /// within it. For arrays the object is the out-of-line payload and the
    /// data starts at its count field.
    Store { obj: Obj, off: usize },
    /// Memory-only: a private primitive buffer with no backing object.
    Mem { buf: [u8; MEM_VALUE_MAX], len: usize },
}

/// A transient binding used to read or write one attribute value.
pub struct Value {
    attr: Attr,
    backing: Backing,
}

impl Value {
    /// Bind an attribute of a record. For array attributes this follows the
    /// stored reference; an unset array reports `NotFound`.
    pub fn init(record: &Record, attr: &Attr) -> Result<Value> {
        let off = attr.offset() as usize;
        if !attr.is_array() {
            return Ok(Value {
                attr: attr.clone(),
                backing: Backing::Store {
                    obj: record.obj().clone(),
                    off,
                },
            });
        }
        let child_ref: Ref = record.obj().read(off)?;
        if child_ref == 0 {
            return Err(StoreError::NotFound(format!(
                "array attribute {:?} is unset",
                attr.name()
            )));
        }
        let child = record.obj().ods().ref_as_obj(child_ref)?;
        Ok(Value {
            attr: attr.clone(),
            backing: Backing::Store {
                obj: child,
                off: RECORD_HDR,
            },
        })
    }

    /// A memory-only value with a private buffer. Reference-typed attributes
    /// cannot be bound without an object.
    pub fn mem(attr: &Attr) -> Result<Value> {
        if attr.is_ref() {
            return Err(StoreError::Invalid(
                "reference-typed attribute bound without an object",
            ));
        }
        Ok(Value {
            attr: attr.clone(),
            backing: Backing::Mem {
                buf: [0; MEM_VALUE_MAX],
                len: attr.size(),
            },
        })
    }

    /// Allocate an out-of-line array payload of `count` elements in the
    /// record's store, point the record's attribute at it, and bind it.
    pub fn array_new(record: &Record, attr: &Attr, count: u32) -> Result<Value> {
        if !attr.is_array() {
            return Err(StoreError::Invalid("attribute is not an array"));
        }
        let ischema = get_ischema(attr.ty())?;
        let elem = ischema.record_size();
        let size = RECORD_HDR + 4 + count as usize * elem;
        let child = record.obj().ods().alloc_obj_grow(size)?;
        child.with_bytes_mut(|bytes| bytes.fill(0))?;
        child.write(
            0,
            &RecordHeader {
                schema_id: ischema.id(),
                flags: 0,
            },
        )?;
        child.write(RECORD_HDR, &count)?;
        record.obj().write(attr.offset() as usize, &child.ods_ref())?;
        Ok(Value {
            attr: attr.clone(),
            backing: Backing::Store {
                obj: child,
                off: RECORD_HDR,
            },
        })
    }

    /// Bind by attribute name.
    pub fn by_name(record: &Record, name: &str) -> Result<Value> {
        let attr = record
            .schema()
            .attr_by_name(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        Value::init(record, &attr)
    }

    /// Bind by attribute ordinal id.
    pub fn by_id(record: &Record, id: u32) -> Result<Value> {
        let attr = record
            .schema()
            .attr_by_id(id)
            .ok_or_else(|| StoreError::NotFound(format!("attribute id {id}")))?;
        Value::init(record, &attr)
    }

    pub fn attr(&self) -> &Attr {
        &self.attr
    }

    pub fn ty(&self) -> Type {
        self.attr.ty()
    }

    /// The bound object: the record for primitives, the array payload for
    /// arrays. Memory-only values have none.
    pub fn obj(&self) -> Option<&Obj> {
        match &self.backing {
            Backing::Store { obj, .. } => Some(obj),
            Backing::Mem { .. } => None,
        }
    }

    /// Element count of a bound array value.
    pub fn array_count(&self) -> Result<u32> {
        if !self.attr.is_array() {
            return Err(StoreError::Invalid("attribute is not an array"));
        }
        let raw = self.read_bytes(0, 4)?;
        Ok(LittleEndian::read_u32(&raw))
    }

    /// Bytes of value data: the footprint for primitives, `count × element`
    /// for arrays.
    pub fn size(&self) -> Result<usize> {
        (self.attr.ops().size)(self)
    }

    /// The value's textual form.
    pub fn to_str(&self) -> Result<String> {
        let mut out = String::new();
        (self.attr.ops().to_str)(self, &mut out)?;
        Ok(out)
    }

    /// Parse `text` and store it. Array values must already be bound with
    /// enough capacity.
    pub fn from_str(&mut self, text: &str) -> Result<()> {
        (self.attr.ops().from_str)(self, text)
    }

    /// The canonical comparable key encoding the index layer expects.
    pub fn as_key(&self) -> Result<Vec<u8>> {
        let mut key = Vec::new();
        (self.attr.ops().key_value)(self, &mut key)?;
        Ok(key)
    }

    /// Bounded byte copy into the value data; returns how much was copied.
    pub fn memset(&mut self, src: &[u8]) -> Result<usize> {
        let len = src.len().min(self.size()?);
        let rel = if self.attr.is_array() { 4 } else { 0 };
        self.write_bytes(rel, &src[..len])?;
        Ok(len)
    }

    /// Copy `len` bytes of value data starting at `rel`. For arrays, offset
    /// zero is the count field and elements start at four.
    pub(crate) fn read_bytes(&self, rel: usize, len: usize) -> Result<Vec<u8>> {
        match &self.backing {
            Backing::Store { obj, off } => obj
                .with_bytes(|bytes| bytes.get(off + rel..off + rel + len).map(<[u8]>::to_vec))?
                .ok_or(StoreError::InvalidAccess {
                    offset: obj.ods_ref(),
                    len: rel + len,
                }),
            Backing::Mem { buf, len: cap } => buf
                .get(rel..rel + len)
                .filter(|_| rel + len <= *cap)
                .map(<[u8]>::to_vec)
                .ok_or(StoreError::InvalidAccess {
                    offset: 0,
                    len: rel + len,
                }),
        }
    }

    pub(crate) fn write_bytes(&mut self, rel: usize, src: &[u8]) -> Result<()> {
        match &mut self.backing {
            Backing::Store { obj, off } => obj.copy_from_slice(*off + rel, src),
            Backing::Mem { buf, len: cap } => match buf.get_mut(rel..rel + src.len()) {
                Some(dst) if rel + src.len() <= *cap => {
                    dst.copy_from_slice(src);
                    Ok(())
                }
                _ => Err(StoreError::InvalidAccess {
                    offset: 0,
                    len: rel + src.len(),
                }),
            },
        }
    }
}

impl Record {
    /// Bind `attr` and read its textual form.
    pub fn attr_to_str(&self, attr: &Attr) -> Result<String> {
        Value::init(self, attr)?.to_str()
    }

    /// Parse `text` into `attr`.
    ///
    /// Byte arrays are allocated (or replaced, when the existing payload is
    /// too short for the text plus its terminator) before writing. Other
    /// array kinds must be allocated explicitly with [`Value::array_new`].
    pub fn attr_from_str(&self, attr: &Attr, text: &str) -> Result<()> {
        if !attr.is_array() {
            return Value::init(self, attr)?.from_str(text);
        }
        if attr.ty() != Type::ByteArray {
            return Err(StoreError::Invalid(
                "only byte arrays can be parsed from a string",
            ));
        }
        let need = text.len() + 1;
        match Value::init(self, attr) {
            Ok(mut value) => {
                if value.array_count()? as usize >= need {
                    return value.from_str(text);
                }
                // Too short: delete the payload and unset the attribute
                match value.obj() {
                    Some(child) => child.delete()?,
                    None => return Err(StoreError::Invalid("array value has no backing object")),
                }
                self.obj().write(attr.offset() as usize, &0u64)?;
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Value::array_new(self, attr, need as u32)?.from_str(text)
    }

    /// Bind `attr` and produce its index key.
    pub fn attr_as_key(&self, attr: &Attr) -> Result<Vec<u8>> {
        Value::init(self, attr)?.as_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::schema::{schema_from_template, AttrTemplate, SchemaTemplate};

    fn sample() -> (tempfile::TempDir, Container, Record) {
        let dir = tempfile::tempdir().unwrap();
        let store = Container::open(dir.path().join("c")).unwrap();
        let schema = schema_from_template(&SchemaTemplate {
            name: "sample",
            attrs: &[
                AttrTemplate {
                    name: "seq",
                    ty: Type::Int32,
                    indexed: false,
                },
                AttrTemplate {
                    name: "when",
                    ty: Type::Timestamp,
                    indexed: false,
                },
                AttrTemplate {
                    name: "name",
                    ty: Type::ByteArray,
                    indexed: false,
                },
                AttrTemplate {
                    name: "readings",
                    ty: Type::DoubleArray,
                    indexed: false,
                },
            ],
        })
        .unwrap();
        store.schema_add(&schema).unwrap();
        let rec = store.obj_new(&schema).unwrap();
        (dir, store, rec)
    }

    #[test]
    fn primitive_strings_round_trip() {
        let (_dir, _sos, rec) = sample();
        let seq = rec.schema().attr_by_name("seq").unwrap();
        rec.attr_from_str(&seq, "-42").unwrap();
        assert_eq!(rec.attr_to_str(&seq).unwrap(), "-42");

        let when = rec.schema().attr_by_name("when").unwrap();
        rec.attr_from_str(&when, "1700000000.000123").unwrap();
        assert_eq!(rec.attr_to_str(&when).unwrap(), "1700000000.000123");
    }

    #[test]
    fn byte_array_allocates_then_reallocates() {
        let (_dir, _sos, rec) = sample();
        let name = rec.schema().attr_by_name("name").unwrap();
        rec.attr_from_str(&name, "HI").unwrap();
        let first_ref: Ref = rec.obj().read(name.offset() as usize).unwrap();
        assert_ne!(first_ref, 0);
        assert_eq!(rec.attr_to_str(&name).unwrap(), "HI");
        // Capacity 3 < 6 forces a delete-and-reallocate
        rec.attr_from_str(&name, "HELLO").unwrap();
        let second_ref: Ref = rec.obj().read(name.offset() as usize).unwrap();
        assert_ne!(second_ref, first_ref);
        assert_eq!(rec.attr_to_str(&name).unwrap(), "HELLO");
        // Shrinking reuses the payload in place
        rec.attr_from_str(&name, "YO").unwrap();
        let third_ref: Ref = rec.obj().read(name.offset() as usize).unwrap();
        assert_eq!(third_ref, second_ref);
    }

    #[test]
    fn unset_arrays_are_unbound() {
        let (_dir, _sos, rec) = sample();
        let readings = rec.schema().attr_by_name("readings").unwrap();
        assert!(matches!(
            Value::init(&rec, &readings),
            Err(StoreError::NotFound(_))
        ));
        // Non-byte arrays can't be written through from_str either
        assert!(matches!(
            rec.attr_from_str(&readings, "1,2"),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn numeric_array_binding_and_count() {
        let (_dir, _sos, rec) = sample();
        let readings = rec.schema().attr_by_name("readings").unwrap();
        let mut v = Value::array_new(&rec, &readings, 3).unwrap();
        assert_eq!(v.array_count().unwrap(), 3);
        assert_eq!(v.size().unwrap(), 24);
        v.from_str("0.5,1.5,2.5").unwrap();
        assert_eq!(v.to_str().unwrap(), "0.5,1.5,2.5");
        // The stored payload advertises the recorded count
        let bound = Value::init(&rec, &readings).unwrap();
        assert_eq!(bound.array_count().unwrap(), 3);
        assert!(bound.obj().unwrap().size() >= RECORD_HDR + 4 + 3 * std::mem::size_of::<f64>());
        assert!(v.from_str("1,2").is_err());
    }

    #[test]
    fn memory_values_hold_primitives_only() {
        let (_dir, _sos, rec) = sample();
        let seq = rec.schema().attr_by_name("seq").unwrap();
        let mut v = Value::mem(&seq).unwrap();
        v.from_str("7").unwrap();
        assert_eq!(v.to_str().unwrap(), "7");
        assert!(v.obj().is_none());

        let name = rec.schema().attr_by_name("name").unwrap();
        assert!(matches!(Value::mem(&name), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn keys_compare_like_values() {
        let (_dir, _sos, rec) = sample();
        let seq = rec.schema().attr_by_name("seq").unwrap();
        rec.attr_from_str(&seq, "-10").unwrap();
        let low = rec.attr_as_key(&seq).unwrap();
        rec.attr_from_str(&seq, "10").unwrap();
        let high = rec.attr_as_key(&seq).unwrap();
        assert!(low < high);

        let name = rec.schema().attr_by_name("name").unwrap();
        rec.attr_from_str(&name, "Ada").unwrap();
        assert_eq!(rec.attr_as_key(&name).unwrap(), b"Ada");
    }

    #[test]
    fn memset_is_bounded() {
        let (_dir, _sos, rec) = sample();
        let seq = rec.schema().attr_by_name("seq").unwrap();
        let mut v = Value::init(&rec, &seq).unwrap();
        assert_eq!(v.memset(&[1, 2, 3, 4, 5, 6]).unwrap(), 4);
        assert_eq!(v.to_str().unwrap(), format!("{}", i32::from_le_bytes([1, 2, 3, 4])));
    }

    #[test]
    fn value_lookup_by_name_and_id() {
        let (_dir, _sos, rec) = sample();
        let seq = rec.schema().attr_by_name("seq").unwrap();
        rec.attr_from_str(&seq, "9").unwrap();
        assert_eq!(Value::by_name(&rec, "seq").unwrap().to_str().unwrap(), "9");
        assert_eq!(Value::by_id(&rec, 0).unwrap().to_str().unwrap(), "9");
        assert!(Value::by_name(&rec, "nope").is_err());
    }
}
