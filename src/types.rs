//! The attribute type system: 18 type tags, their in-record footprints and
//! array element sizes, and the per-type operation tables (size, to-string,
//! from-string, key extraction) bound to an attribute when it is created.

use std::fmt::Write as _;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytemuck::{Pod, Zeroable};

use crate::error::{Result, StoreError};
use crate::value::Value;

/// Size of the record header preceding attribute storage:
/// `{schema_id: u32, flags: u32}`.
pub const RECORD_HDR: usize = 8;

/// Header at the start of every record and array payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct RecordHeader {
    pub schema_id: u32,
    pub flags: u32,
}

/// In-record form of an OBJ attribute: the target's store paired with the
/// object reference inside it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct ObjRef {
    pub ods_ref: u64,
    pub obj_ref: u64,
}

/// Attribute type tag. Ordering is load-bearing: everything from [`Type::Obj`]
/// up is reference-typed, everything from [`Type::ByteArray`] up is an array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Type {
    Int32 = 0,
    Int64,
    Uint32,
    Uint64,
    Float,
    Double,
    LongDouble,
    Timestamp,
    Obj,
    ByteArray,
    Int32Array,
    Int64Array,
    Uint32Array,
    Uint64Array,
    FloatArray,
    DoubleArray,
    LongDoubleArray,
    ObjArray,
}

pub const TYPE_COUNT: usize = 18;

impl Type {
    pub fn from_u32(tag: u32) -> Option<Type> {
        use Type::*;
        Some(match tag {
            0 => Int32,
            1 => Int64,
            2 => Uint32,
            3 => Uint64,
            4 => Float,
            5 => Double,
            6 => LongDouble,
            7 => Timestamp,
            8 => Obj,
            9 => ByteArray,
            10 => Int32Array,
            11 => Int64Array,
            12 => Uint32Array,
            13 => Uint64Array,
            14 => FloatArray,
            15 => DoubleArray,
            16 => LongDoubleArray,
            17 => ObjArray,
            _ => return None,
        })
    }

    /// Reference-typed: the in-record bytes hold a reference, not a value.
    pub fn is_ref(self) -> bool {
        self >= Type::Obj
    }

    /// Array-typed: the value lives out of line behind a reference.
    pub fn is_array(self) -> bool {
        self >= Type::ByteArray
    }
}

/// Bytes an attribute of this type occupies inside its parent record. Every
/// array kind stores an 8-byte reference; OBJ stores a reference pair.
pub fn footprint(ty: Type) -> usize {
    use Type::*;
    match ty {
        Int32 | Uint32 | Float => 4,
        Int64 | Uint64 | Double | Timestamp => 8,
        LongDouble => 16,
        Obj => 16,
        ByteArray | Int32Array | Int64Array | Uint32Array | Uint64Array | FloatArray
        | DoubleArray | LongDoubleArray | ObjArray => 8,
    }
}

/// Bytes per element of the out-of-line payload.
pub fn element_size(ty: Type) -> usize {
    use Type::*;
    match ty {
        Int32 | Uint32 | Float | Int32Array | Uint32Array | FloatArray => 4,
        Int64 | Uint64 | Double | Timestamp | Int64Array | Uint64Array | DoubleArray => 8,
        LongDouble | LongDoubleArray => 16,
        Obj | ObjArray => std::mem::size_of::<ObjRef>(),
        ByteArray => 1,
    }
}

/// The textual key-encoding name the index layer accepts for this type.
pub fn default_key_type(ty: Type) -> &'static str {
    use Type::*;
    match ty {
        Int32 => "INT32",
        Int64 => "INT64",
        Uint32 => "UINT32",
        Uint64 => "UINT64",
        Float => "FLOAT",
        Double => "DOUBLE",
        LongDouble => "LONG_DOUBLE",
        Timestamp => "UINT64",
        ByteArray => "STRING",
        Obj | Int32Array | Int64Array | Uint32Array | Uint64Array | FloatArray | DoubleArray
        | LongDoubleArray | ObjArray => "NONE",
    }
}

pub fn type_name(ty: Type) -> &'static str {
    use Type::*;
    match ty {
        Int32 => "INT32",
        Int64 => "INT64",
        Uint32 => "UINT32",
        Uint64 => "UINT64",
        Float => "FLOAT",
        Double => "DOUBLE",
        LongDouble => "LONG_DOUBLE",
        Timestamp => "TIMESTAMP",
        Obj => "OBJ",
        ByteArray => "BYTE_ARRAY",
        Int32Array => "INT32_ARRAY",
        Int64Array => "INT64_ARRAY",
        Uint32Array => "UINT32_ARRAY",
        Uint64Array => "UINT64_ARRAY",
        FloatArray => "FLOAT_ARRAY",
        DoubleArray => "DOUBLE_ARRAY",
        LongDoubleArray => "LONG_DOUBLE_ARRAY",
        ObjArray => "OBJ_ARRAY",
    }
}

/// The four per-type operations an attribute binds at creation time.
pub struct TypeOps {
    /// Bytes of value data: the footprint for primitives, `count × element`
    /// for arrays.
    pub size: fn(&Value) -> Result<usize>,
    /// Append the value's textual form to `buf`.
    pub to_str: fn(&Value, &mut String) -> Result<()>,
    /// Parse `text` and store it through the value.
    pub from_str: fn(&mut Value, &str) -> Result<()>,
    /// Append the value's canonical comparable key encoding to `buf`.
    pub key_value: fn(&Value, &mut Vec<u8>) -> Result<()>,
}

fn prim_size(v: &Value) -> Result<usize> {
    Ok(footprint(v.ty()))
}

fn array_size(v: &Value) -> Result<usize> {
    Ok(v.array_count()? as usize * element_size(v.ty()))
}

fn no_from_str(_: &mut Value, _: &str) -> Result<()> {
    Err(StoreError::Invalid("type cannot be parsed from a string"))
}

fn no_key(_: &Value, _: &mut Vec<u8>) -> Result<()> {
    Err(StoreError::Invalid("type has no key encoding"))
}

// Comparable encodings: unsigned as-is, signed with the sign bit flipped,
// floats in IEEE total order. All big-endian so memcmp order equals value
// order.
fn key_u32(x: u32, buf: &mut Vec<u8>) {
    let mut k = [0u8; 4];
    BigEndian::write_u32(&mut k, x);
    buf.extend_from_slice(&k);
}

fn key_u64(x: u64, buf: &mut Vec<u8>) {
    let mut k = [0u8; 8];
    BigEndian::write_u64(&mut k, x);
    buf.extend_from_slice(&k);
}

fn total_order_f64(x: f64) -> u64 {
    let b = x.to_bits();
    if b >> 63 == 1 {
        !b
    } else {
        b | (1 << 63)
    }
}

fn total_order_f32(x: f32) -> u32 {
    let b = x.to_bits();
    if b >> 31 == 1 {
        !b
    } else {
        b | (1 << 31)
    }
}

macro_rules! numeric_ops {
    ($prim:ident, $arr:ident, $t:ty, $read:path, $write:path, $key:expr) => {
        static $prim: TypeOps = TypeOps {
            size: prim_size,
            to_str: |v, buf| {
                let x: $t = <$t>::from_bits_ext($read(&v.read_bytes(0, std::mem::size_of::<$t>())?));
                write!(buf, "{x}").ok();
                Ok(())
            },
            from_str: |v, text| {
                let x: $t = text
                    .trim()
                    .parse()
                    .map_err(|_| StoreError::Invalid("unparsable number"))?;
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                $write(&mut raw, x.to_bits_ext());
                v.write_bytes(0, &raw)
            },
            key_value: |v, buf| {
                let x: $t = <$t>::from_bits_ext($read(&v.read_bytes(0, std::mem::size_of::<$t>())?));
                $key(x, buf);
                Ok(())
            },
        };
        static $arr: TypeOps = TypeOps {
            size: array_size,
            to_str: |v, buf| {
                let count = v.array_count()? as usize;
                let elem = std::mem::size_of::<$t>();
                let raw = v.read_bytes(4, count * elem)?;
                for (i, chunk) in raw.chunks_exact(elem).enumerate() {
                    if i > 0 {
                        buf.push(',');
                    }
                    let x: $t = <$t>::from_bits_ext($read(chunk));
                    write!(buf, "{x}").ok();
                }
                Ok(())
            },
            from_str: |v, text| {
                let count = v.array_count()? as usize;
                let items: Vec<$t> = text
                    .split(',')
                    .map(|s| s.trim().parse())
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|_| StoreError::Invalid("unparsable array element"))?;
                if items.len() != count {
                    return Err(StoreError::Invalid("array length mismatch"));
                }
                let elem = std::mem::size_of::<$t>();
                let mut raw = vec![0u8; count * elem];
                for (chunk, x) in raw.chunks_exact_mut(elem).zip(items) {
                    $write(chunk, x.to_bits_ext());
                }
                v.write_bytes(4, &raw)
            },
            key_value: no_key,
        };
    };
}

/// Uniform raw-bits view so one macro covers integers and floats.
trait BitsExt {
    type Bits;
    fn from_bits_ext(bits: Self::Bits) -> Self;
    fn to_bits_ext(self) -> Self::Bits;
}

macro_rules! bits_ident {
    ($($t:ty),*) => {$(
        impl BitsExt for $t {
            type Bits = $t;
            fn from_bits_ext(bits: $t) -> $t { bits }
            fn to_bits_ext(self) -> $t { self }
        }
    )*};
}
bits_ident!(u32, u64);

impl BitsExt for i32 {
    type Bits = u32;
    fn from_bits_ext(bits: u32) -> i32 {
        bits as i32
    }
    fn to_bits_ext(self) -> u32 {
        self as u32
    }
}

impl BitsExt for i64 {
    type Bits = u64;
    fn from_bits_ext(bits: u64) -> i64 {
        bits as i64
    }
    fn to_bits_ext(self) -> u64 {
        self as u64
    }
}

impl BitsExt for f32 {
    type Bits = u32;
    fn from_bits_ext(bits: u32) -> f32 {
        f32::from_bits(bits)
    }
    fn to_bits_ext(self) -> u32 {
        self.to_bits()
    }
}

impl BitsExt for f64 {
    type Bits = u64;
    fn from_bits_ext(bits: u64) -> f64 {
        f64::from_bits(bits)
    }
    fn to_bits_ext(self) -> u64 {
        self.to_bits()
    }
}

numeric_ops!(OPS_INT32, OPS_INT32_ARRAY, i32, LittleEndian::read_u32, LittleEndian::write_u32, |x: i32, buf: &mut Vec<u8>| key_u32((x as u32) ^ (1 << 31), buf));
numeric_ops!(OPS_INT64, OPS_INT64_ARRAY, i64, LittleEndian::read_u64, LittleEndian::write_u64, |x: i64, buf: &mut Vec<u8>| key_u64((x as u64) ^ (1 << 63), buf));
numeric_ops!(OPS_UINT32, OPS_UINT32_ARRAY, u32, LittleEndian::read_u32, LittleEndian::write_u32, key_u32);
numeric_ops!(OPS_UINT64, OPS_UINT64_ARRAY, u64, LittleEndian::read_u64, LittleEndian::write_u64, key_u64);
numeric_ops!(OPS_FLOAT, OPS_FLOAT_ARRAY, f32, LittleEndian::read_u32, LittleEndian::write_u32, |x: f32, buf: &mut Vec<u8>| key_u32(total_order_f32(x), buf));
numeric_ops!(OPS_DOUBLE, OPS_DOUBLE_ARRAY, f64, LittleEndian::read_u64, LittleEndian::write_u64, |x: f64, buf: &mut Vec<u8>| key_u64(total_order_f64(x), buf));

// LONG_DOUBLE is an opaque 16-byte slot; textual and key forms go through
// an f64 held in the low 8 bytes.
fn ld_read(v: &Value, off: usize) -> Result<f64> {
    Ok(f64::from_bits(LittleEndian::read_u64(
        &v.read_bytes(off, 8)?,
    )))
}

fn ld_write(v: &mut Value, off: usize, x: f64) -> Result<()> {
    let mut raw = [0u8; 16];
    LittleEndian::write_u64(&mut raw[..8], x.to_bits());
    v.write_bytes(off, &raw)
}

static OPS_LONG_DOUBLE: TypeOps = TypeOps {
    size: prim_size,
    to_str: |v, buf| {
        write!(buf, "{}", ld_read(v, 0)?).ok();
        Ok(())
    },
    from_str: |v, text| {
        let x: f64 = text
            .trim()
            .parse()
            .map_err(|_| StoreError::Invalid("unparsable number"))?;
        ld_write(v, 0, x)
    },
    key_value: |v, buf| {
        key_u64(total_order_f64(ld_read(v, 0)?), buf);
        Ok(())
    },
};

static OPS_LONG_DOUBLE_ARRAY: TypeOps = TypeOps {
    size: array_size,
    to_str: |v, buf| {
        let count = v.array_count()? as usize;
        for i in 0..count {
            if i > 0 {
                buf.push(',');
            }
            write!(buf, "{}", ld_read(v, 4 + i * 16)?).ok();
        }
        Ok(())
    },
    from_str: |v, text| {
        let count = v.array_count()? as usize;
        let items: Vec<f64> = text
            .split(',')
            .map(|s| s.trim().parse())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| StoreError::Invalid("unparsable array element"))?;
        if items.len() != count {
            return Err(StoreError::Invalid("array length mismatch"));
        }
        for (i, x) in items.into_iter().enumerate() {
            ld_write(v, 4 + i * 16, x)?;
        }
        Ok(())
    },
    key_value: no_key,
};

static OPS_TIMESTAMP: TypeOps = TypeOps {
    size: prim_size,
    to_str: |v, buf| {
        let raw = v.read_bytes(0, 8)?;
        let sec = LittleEndian::read_u32(&raw[..4]);
        let usec = LittleEndian::read_u32(&raw[4..]);
        write!(buf, "{sec}.{usec:06}").ok();
        Ok(())
    },
    from_str: |v, text| {
        let text = text.trim();
        let (sec, usec) = match text.split_once('.') {
            Some((s, u)) => (s, u),
            None => (text, "0"),
        };
        let sec: u32 = sec
            .parse()
            .map_err(|_| StoreError::Invalid("unparsable timestamp seconds"))?;
        let usec: u32 = usec
            .parse()
            .map_err(|_| StoreError::Invalid("unparsable timestamp microseconds"))?;
        let mut raw = [0u8; 8];
        LittleEndian::write_u32(&mut raw[..4], sec);
        LittleEndian::write_u32(&mut raw[4..], usec);
        v.write_bytes(0, &raw)
    },
    key_value: |v, buf| {
        let raw = v.read_bytes(0, 8)?;
        let sec = LittleEndian::read_u32(&raw[..4]);
        let usec = LittleEndian::read_u32(&raw[4..]);
        key_u64(((sec as u64) << 32) | usec as u64, buf);
        Ok(())
    },
};

static OPS_OBJ: TypeOps = TypeOps {
    size: prim_size,
    to_str: |v, buf| {
        let raw = v.read_bytes(0, 16)?;
        let r: ObjRef = bytemuck::pod_read_unaligned(&raw);
        write!(buf, "{:x}@{:x}", r.ods_ref, r.obj_ref).ok();
        Ok(())
    },
    from_str: no_from_str,
    key_value: no_key,
};

// The C-string convention holds for byte arrays: the payload carries the
// text plus a trailing nul, and the count includes it.
static OPS_BYTE_ARRAY: TypeOps = TypeOps {
    size: array_size,
    to_str: |v, buf| {
        let count = v.array_count()? as usize;
        let raw = v.read_bytes(4, count)?;
        let text = match raw.iter().position(|b| *b == 0) {
            Some(nul) => &raw[..nul],
            None => &raw[..],
        };
        buf.push_str(&String::from_utf8_lossy(text));
        Ok(())
    },
    from_str: |v, text| {
        let count = v.array_count()? as usize;
        if count < text.len() + 1 {
            return Err(StoreError::Invalid("byte array is too short for the string"));
        }
        let mut raw = text.as_bytes().to_vec();
        raw.push(0);
        v.write_bytes(4, &raw)
    },
    key_value: |v, buf| {
        let count = v.array_count()? as usize;
        let raw = v.read_bytes(4, count)?;
        let key = match raw.iter().position(|b| *b == 0) {
            Some(nul) => &raw[..nul],
            None => &raw[..],
        };
        buf.extend_from_slice(key);
        Ok(())
    },
};

static OPS_OBJ_ARRAY: TypeOps = TypeOps {
    size: array_size,
    to_str: |v, buf| {
        let count = v.array_count()? as usize;
        let raw = v.read_bytes(4, count * 16)?;
        for (i, chunk) in raw.chunks_exact(16).enumerate() {
            if i > 0 {
                buf.push(',');
            }
            let r: ObjRef = bytemuck::pod_read_unaligned(chunk);
            write!(buf, "{:x}@{:x}", r.ods_ref, r.obj_ref).ok();
        }
        Ok(())
    },
    from_str: no_from_str,
    key_value: no_key,
};

/// The operation table for a type tag.
pub fn ops_for(ty: Type) -> &'static TypeOps {
    use Type::*;
    match ty {
        Int32 => &OPS_INT32,
        Int64 => &OPS_INT64,
        Uint32 => &OPS_UINT32,
        Uint64 => &OPS_UINT64,
        Float => &OPS_FLOAT,
        Double => &OPS_DOUBLE,
        LongDouble => &OPS_LONG_DOUBLE,
        Timestamp => &OPS_TIMESTAMP,
        Obj => &OPS_OBJ,
        ByteArray => &OPS_BYTE_ARRAY,
        Int32Array => &OPS_INT32_ARRAY,
        Int64Array => &OPS_INT64_ARRAY,
        Uint32Array => &OPS_UINT32_ARRAY,
        Uint64Array => &OPS_UINT64_ARRAY,
        FloatArray => &OPS_FLOAT_ARRAY,
        DoubleArray => &OPS_DOUBLE_ARRAY,
        LongDoubleArray => &OPS_LONG_DOUBLE_ARRAY,
        ObjArray => &OPS_OBJ_ARRAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for tag in 0..TYPE_COUNT as u32 {
            let ty = Type::from_u32(tag).unwrap();
            assert_eq!(ty as u32, tag);
        }
        assert!(Type::from_u32(TYPE_COUNT as u32).is_none());
    }

    #[test]
    fn footprints_match_the_layout_rules() {
        // Arrays always store an 8-byte reference in the record
        for ty in [
            Type::ByteArray,
            Type::Int32Array,
            Type::Int64Array,
            Type::Uint32Array,
            Type::Uint64Array,
            Type::FloatArray,
            Type::DoubleArray,
            Type::LongDoubleArray,
            Type::ObjArray,
        ] {
            assert_eq!(footprint(ty), 8);
            assert!(ty.is_array());
            assert!(ty.is_ref());
        }
        assert_eq!(footprint(Type::Obj), 16);
        assert!(Type::Obj.is_ref());
        assert!(!Type::Obj.is_array());
        assert_eq!(footprint(Type::LongDouble), 16);
        assert_eq!(footprint(Type::Timestamp), 8);
        assert_eq!(element_size(Type::ByteArray), 1);
        assert_eq!(element_size(Type::LongDoubleArray), 16);
    }

    #[test]
    fn key_types_follow_the_table() {
        assert_eq!(default_key_type(Type::Int32), "INT32");
        assert_eq!(default_key_type(Type::Timestamp), "UINT64");
        assert_eq!(default_key_type(Type::ByteArray), "STRING");
        assert_eq!(default_key_type(Type::Obj), "NONE");
        assert_eq!(default_key_type(Type::Uint64Array), "NONE");
    }

    #[test]
    fn comparable_encodings_sort_like_values() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        key_u64((-5i64 as u64) ^ (1 << 63), &mut a);
        key_u64((3i64 as u64) ^ (1 << 63), &mut b);
        assert!(a < b);

        a.clear();
        b.clear();
        key_u64(total_order_f64(-1.5), &mut a);
        key_u64(total_order_f64(0.25), &mut b);
        assert!(a < b);
        a.clear();
        key_u64(total_order_f64(-0.0), &mut a);
        b.clear();
        key_u64(total_order_f64(1e300), &mut b);
        assert!(a < b);
    }
}
