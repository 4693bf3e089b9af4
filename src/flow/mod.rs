pub mod audit;
pub mod error_mapper;
pub mod gate;
pub mod query_logger;
pub mod registry;
pub mod settings;

pub use audit::{AuditAction, AuditDescriptor, AuditLogger, LogMessage, NoopAuditLogger, TracingAuditLogger};
pub use error_mapper::{DefaultErrorMapper, ErrorMapper, ErrorResponse};
pub use gate::{Gate, GateResponse};
pub use query_logger::{NoopQueryLogger, QueryLogger, TracingQueryLogger};
pub use registry::TransactionRegistry;
pub use settings::GateSettings;
