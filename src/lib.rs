// ============================================================================
// modelgate
// ============================================================================
//
// Registered model types exposed as a permission-checked resource graph:
//
//   dictionary  -> bindings: attributes, relationships, inverses, hooks
//   security    -> permission expressions, checks, executor
//   request     -> per-request scope, identity cache, lifecycle events
//   resource    -> persistent resource wrapper (reads, writes, relations)
//   datastore   -> persistence traits and the in-memory reference store
//   flow        -> request orchestration, registry, audit, error mapping
//   aggregation -> analytic query planning and SQL translation
//
// ============================================================================

pub mod aggregation;
pub mod core;
pub mod datastore;
pub mod dictionary;
pub mod filter;
pub mod flow;
pub mod request;
pub mod resource;
pub mod security;

// Re-export main types for convenience
pub use core::{DataType, Entity, FieldValue, GateError, Result, Value};
pub use datastore::{DataStore, DataStoreTransaction, InMemoryDataStore};
pub use dictionary::{EntityBinding, EntityDescriptor, EntityDictionary};
pub use filter::{FilterExpression, Operator, Path};
pub use flow::{Gate, GateResponse, GateSettings};
pub use request::{EntityProjection, RequestScope};
pub use resource::PersistentResource;
pub use security::{PermissionExecutor, User};
