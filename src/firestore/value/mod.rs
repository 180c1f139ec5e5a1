mod array_value;
mod bytes_value;
mod map_value;
mod value;
pub mod values;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use value::{FirestoreValue, ValueKind};
pub use values::{canonical_id, type_order, value_compare, value_equals, TypeOrder};
