//! Variable scope storage.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use flowjob_core::{EngineError, EngineResult, ScopeId, TaskId, TenantId};

/// Whether a variable lookup materializes the value payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueFetch {
    /// Name, scope and type only.
    #[default]
    Metadata,
    Full,
}

/// A variable as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInstance {
    pub name: String,
    pub scope_id: ScopeId,
    pub type_name: String,
    /// `None` unless the lookup asked for `ValueFetch::Full`.
    pub value: Option<serde_json::Value>,
}

impl VariableInstance {
    pub fn new(name: impl Into<String>, scope_id: ScopeId, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            scope_id,
            type_name: json_type_name(&value).to_string(),
            value: Some(value),
        }
    }

    fn fetched(&self, fetch: ValueFetch) -> Self {
        match fetch {
            ValueFetch::Full => self.clone(),
            ValueFetch::Metadata => Self {
                value: None,
                ..self.clone()
            },
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "long",
        serde_json::Value::Number(_) => "double",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => "json",
    }
}

/// A user task and the scope holding its local variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: TaskId,
    pub scope_id: ScopeId,
    pub name: String,
    pub tenant_id: TenantId,
}

/// Read access to tasks and variable scopes.
pub trait ScopeStore: Send + Sync {
    fn get_task(&self, id: TaskId) -> EngineResult<Option<TaskHandle>>;

    /// Enclosing scope (execution, process or case instance); `None` at the root.
    fn parent_scope(&self, scope_id: ScopeId) -> EngineResult<Option<ScopeId>>;

    /// Variable defined directly on `scope_id`.
    fn get_local_variable(
        &self,
        scope_id: ScopeId,
        name: &str,
        fetch: ValueFetch,
    ) -> EngineResult<Option<VariableInstance>>;

    /// Nearest definition of `name` on `scope_id` or its ancestors.
    fn get_variable(
        &self,
        scope_id: ScopeId,
        name: &str,
        fetch: ValueFetch,
    ) -> EngineResult<Option<VariableInstance>> {
        let mut visited = HashSet::new();
        let mut current = Some(scope_id);
        while let Some(scope) = current {
            if !visited.insert(scope) {
                return Err(EngineError::invalid_argument(format!(
                    "scope chain of {scope_id} contains a cycle at {scope}"
                )));
            }
            if let Some(variable) = self.get_local_variable(scope, name, fetch)? {
                return Ok(Some(variable));
            }
            current = self.parent_scope(scope)?;
        }
        Ok(None)
    }
}

impl<S> ScopeStore for Arc<S>
where
    S: ScopeStore + ?Sized,
{
    fn get_task(&self, id: TaskId) -> EngineResult<Option<TaskHandle>> {
        (**self).get_task(id)
    }

    fn parent_scope(&self, scope_id: ScopeId) -> EngineResult<Option<ScopeId>> {
        (**self).parent_scope(scope_id)
    }

    fn get_local_variable(
        &self,
        scope_id: ScopeId,
        name: &str,
        fetch: ValueFetch,
    ) -> EngineResult<Option<VariableInstance>> {
        (**self).get_local_variable(scope_id, name, fetch)
    }

    fn get_variable(
        &self,
        scope_id: ScopeId,
        name: &str,
        fetch: ValueFetch,
    ) -> EngineResult<Option<VariableInstance>> {
        (**self).get_variable(scope_id, name, fetch)
    }
}

fn poisoned<T>(_: PoisonError<T>) -> EngineError {
    EngineError::storage("scope store lock poisoned")
}

/// In-memory scope store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryScopeStore {
    tasks: RwLock<HashMap<TaskId, TaskHandle>>,
    parents: RwLock<HashMap<ScopeId, ScopeId>>,
    variables: RwLock<HashMap<(ScopeId, String), VariableInstance>>,
}

impl InMemoryScopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_task(&self, task: TaskHandle) -> EngineResult<()> {
        self.tasks.write().map_err(poisoned)?.insert(task.id, task);
        Ok(())
    }

    pub fn set_parent(&self, scope_id: ScopeId, parent: ScopeId) -> EngineResult<()> {
        self.parents
            .write()
            .map_err(poisoned)?
            .insert(scope_id, parent);
        Ok(())
    }

    pub fn set_variable(
        &self,
        scope_id: ScopeId,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> EngineResult<()> {
        let name = name.into();
        let variable = VariableInstance::new(name.clone(), scope_id, value);
        self.variables
            .write()
            .map_err(poisoned)?
            .insert((scope_id, name), variable);
        Ok(())
    }
}

impl ScopeStore for InMemoryScopeStore {
    fn get_task(&self, id: TaskId) -> EngineResult<Option<TaskHandle>> {
        Ok(self.tasks.read().map_err(poisoned)?.get(&id).cloned())
    }

    fn parent_scope(&self, scope_id: ScopeId) -> EngineResult<Option<ScopeId>> {
        Ok(self.parents.read().map_err(poisoned)?.get(&scope_id).copied())
    }

    fn get_local_variable(
        &self,
        scope_id: ScopeId,
        name: &str,
        fetch: ValueFetch,
    ) -> EngineResult<Option<VariableInstance>> {
        let variables = self.variables.read().map_err(poisoned)?;
        Ok(variables
            .get(&(scope_id, name.to_string()))
            .map(|v| v.fetched(fetch)))
    }
}
