pub mod error;
pub mod policy;
pub mod store;

pub use error::{CoalescerError, ConfigError, StoreError};
pub use policy::{FailedFlush, FailurePolicy, MergePolicy};
pub use store::{FieldUpdate, FieldValue, PartialUpdateStore, TargetKey, TargetRef};
