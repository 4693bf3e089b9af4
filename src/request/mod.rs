pub mod cache;
pub mod event;
pub mod projection;
pub mod scope;

pub use cache::ObjectEntityCache;
pub use event::{ChangeSpec, CrudEvent};
pub use projection::{EntityProjection, Pagination, SortOrder, Sorting};
pub use scope::{RequestScope, RequestScopeBuilder};
