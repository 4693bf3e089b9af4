pub mod memory;
pub mod transaction;

pub use memory::{InMemoryDataStore, InMemoryTransaction};
pub use transaction::{DataStore, DataStoreTransaction, EntityStream, FeatureSupport};
