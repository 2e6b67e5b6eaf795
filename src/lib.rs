//! sediment is an embedded, persistent typed object store for scientific and
//! telemetry data.
//!
//! A [`Container`] holds many schema-described records. Each record is a
//! fixed-size tuple of typed attributes plus out-of-line variable-length
//! arrays. Storage is memory-mapped: the on-disk layout equals the in-memory
//! layout, and references between records are byte offsets ([`Ref`]) inside
//! a growable backing file.
//!
//! The two load-bearing layers are the object data store ([`Ods`]), a
//! persistent heap handing out reference-counted handles ([`Obj`]), and the
//! schema/value layer ([`Schema`], [`Attr`], [`Value`]) that turns an
//! attribute access into a pointer, or a follow-reference-then-pointer for
//! arrays.
//!
//! ```no_run
//! use sediment::{Container, Type, SchemaTemplate, AttrTemplate};
//!
//! let store = Container::open("samples")?;
//! let schema = sediment::schema_from_template(&SchemaTemplate {
//!     name: "employee",
//!     attrs: &[
//!         AttrTemplate { name: "First", ty: Type::ByteArray, indexed: true },
//!         AttrTemplate { name: "Salary", ty: Type::Float, indexed: false },
//!     ],
//! })?;
//! store.schema_add(&schema)?;
//! let rec = store.obj_new(&schema)?;
//! rec.attr_from_str(&schema.attr_by_name("First").unwrap(), "Ada")?;
//! # Ok::<(), sediment::StoreError>(())
//! ```

mod alloc;
pub mod attr;
pub mod container;
mod error;
pub mod index;
mod mapping;
pub mod ods;
pub mod schema;
pub mod types;
pub mod value;

pub use attr::{Attr, ATTR_NAME_MAX};
pub use container::{Container, Record};
pub use error::{Result, StoreError};
pub use ods::{Obj, Ods, OdsOptions, EXTEND_MIN};
pub use schema::{
    get_ischema, schema_from_template, AttrTemplate, Schema, SchemaTemplate, SCHEMA_NAME_MAX,
};
pub use types::Type;
pub use value::Value;

/// A persistent reference: a byte offset into a store's backing file. Stable
/// across restarts. Zero is the reserved null reference.
pub type Ref = u64;

/// The reserved null reference.
pub const NULL_REF: Ref = 0;

/// How a commit relates to durability: `Sync` returns once the flush is
/// durable, `Async` issues the flush and returns immediately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitMode {
    #[default]
    Async,
    Sync,
}
