//! Permission expression engine.

pub mod check;
pub mod executor;
pub mod expression;
pub mod parser;
pub mod permission;
pub mod user;

pub use check::{Check, CheckFactory, CheckKind, CheckRegistry, RoleCheck};
pub use executor::PermissionExecutor;
pub use expression::{EvaluationMode, ExpressionResult, PermissionExpression};
pub use parser::parse_expression;
pub use permission::{PermissionAnnotation, PermissionKind, PermissionSet};
pub use user::User;
