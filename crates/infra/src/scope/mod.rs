//! Variable scopes: tasks, their enclosing scopes, and variable resolution.

pub mod resolver;
pub mod store;

pub use resolver::ScopeResolver;
pub use store::{InMemoryScopeStore, ScopeStore, TaskHandle, ValueFetch, VariableInstance};
