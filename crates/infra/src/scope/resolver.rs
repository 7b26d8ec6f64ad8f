//! Local versus inherited variable lookup.

use tracing::trace;

use flowjob_core::{EngineResult, ScopeId};

use super::store::{ScopeStore, ValueFetch, VariableInstance};

/// Resolves variable names against a scope or its ancestor chain.
#[derive(Debug, Clone)]
pub struct ScopeResolver<S> {
    store: S,
}

impl<S: ScopeStore> ScopeResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Look up `name` starting at `scope_id`.
    ///
    /// With `is_local` only `scope_id` itself is searched, so a variable defined
    /// solely on an ancestor is "not found". Otherwise the nearest definition along
    /// the ancestor chain wins. Absence is `Ok(None)`, never an error.
    pub fn resolve(
        &self,
        scope_id: ScopeId,
        name: &str,
        is_local: bool,
        fetch: ValueFetch,
    ) -> EngineResult<Option<VariableInstance>> {
        let found = if is_local {
            self.store.get_local_variable(scope_id, name, fetch)?
        } else {
            self.store.get_variable(scope_id, name, fetch)?
        };
        trace!(scope_id = %scope_id, name, is_local, found = found.is_some(), "resolved variable");
        Ok(found)
    }
}
