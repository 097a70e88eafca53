pub mod engine;
pub mod rules;
pub mod signature;
pub mod validator;

pub use engine::{Evaluation, PermissionEngine};
pub use rules::{PermissionRule, Permissions};
