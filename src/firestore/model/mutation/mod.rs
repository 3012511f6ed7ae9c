mod field_transform;
#[allow(clippy::module_inception)]
mod mutation;
mod mutation_batch;
mod precondition;
mod user_data;

pub use field_transform::{FieldTransform, TransformOperation};
pub use mutation::{Mutation, MutationResult};
pub use mutation_batch::{MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use precondition::Precondition;
