pub mod dsl;
pub mod replace;
pub mod value;

pub use dsl::{CompiledExpression, DslError, HelperRegistry, evaluate};
pub use replace::{Unresolved, evaluate_template, replace, replace_one};
pub use value::{Value, VarMap};
