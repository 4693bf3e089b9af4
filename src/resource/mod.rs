pub mod lineage;
pub mod persistent;

pub use lineage::{LineageElement, ResourceLineage};
pub use persistent::PersistentResource;
