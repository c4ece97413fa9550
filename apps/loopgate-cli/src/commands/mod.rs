pub mod decide;
pub mod expand;
pub mod guardrail;
pub mod paths;
pub mod recipes;
pub mod store;
mod util;

pub use decide::DecideArgs;
pub use expand::ExpandArgs;
pub use guardrail::{GuardrailArgs, TimeboxArgs};
pub use paths::{PathsArgs, SchemaArgs};
pub use recipes::RecipesCmd;
pub use store::{ReconcileArgs, TaskCmd};
