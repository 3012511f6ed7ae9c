mod array_value;
mod bytes_value;
mod compare;
mod map_value;
mod object_value;
mod server_timestamp;
mod value;

pub use array_value::ArrayValue;
pub(crate) use bytes_value::base64_bytes;
pub use bytes_value::BytesValue;
pub use compare::{
    canonical_value, compare_values, type_order, values_equal, OrderedValue, TypeOrder,
};
pub use map_value::MapValue;
pub use object_value::ObjectValue;
pub use server_timestamp::{
    is_server_timestamp, server_timestamp_local_write_time, server_timestamp_placeholder,
    server_timestamp_previous_value,
};
pub use value::{FirestoreValue, SentinelValue, ValueKind};
