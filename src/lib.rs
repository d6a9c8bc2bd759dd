pub mod contracts;
pub mod dispatcher;
pub mod metrics;
pub mod storage;

pub use contracts::{FieldUpdate, FieldValue, PartialUpdateStore, TargetRef};
pub use dispatcher::{Dispatcher, DispatcherConfig};
