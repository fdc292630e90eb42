pub mod error;
pub mod object;
pub mod schema;
pub mod value;

pub use error::{Result, StackError, StoreError};
pub use object::{ObjectData, ObjectId, ObjectKey};
pub use schema::{
    Attribute, AttributeKind, EntitySchema, Relationship, SchemaFingerprint, effective_schema,
    resolve_key_path,
};
pub use value::Value;
