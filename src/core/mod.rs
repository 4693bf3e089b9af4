pub mod entity;
pub mod error;
pub mod types;
pub mod value;

pub use entity::{Entity, FieldValue, InstanceId};
pub use error::{GateError, Result};
pub use types::DataType;
pub use value::Value;
