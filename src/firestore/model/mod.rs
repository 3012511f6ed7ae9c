mod document;
mod document_key;
mod document_set;
mod field_mask;
mod field_path;
mod geo_point;
pub mod mutation;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use document::{Document, DocumentMap, DocumentState, DocumentType, WriteState};
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
