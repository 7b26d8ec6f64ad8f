//! Task-scoped commands.

use serde::Deserialize;

use flowjob_core::{EngineResult, TaskId};

use super::{Command, CommandContext, require};
use crate::jobs::JobStore;
use crate::scope::{ScopeStore, ValueFetch, VariableInstance};

/// Read one variable visible from a task.
///
/// `is_local` restricts the lookup to the task's own scope; otherwise the
/// nearest definition along the task's scope chain is returned.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTaskVariable {
    pub task_id: Option<TaskId>,
    pub variable_name: Option<String>,
    #[serde(default)]
    pub is_local: bool,
    #[serde(skip)]
    pub fetch: ValueFetch,
}

impl GetTaskVariable {
    pub fn new(task_id: TaskId, variable_name: impl Into<String>, is_local: bool) -> Self {
        Self {
            task_id: Some(task_id),
            variable_name: Some(variable_name.into()),
            is_local,
            fetch: ValueFetch::Metadata,
        }
    }

    pub fn with_value(mut self) -> Self {
        self.fetch = ValueFetch::Full;
        self
    }
}

impl Command for GetTaskVariable {
    type Output = Option<VariableInstance>;

    const NAME: &'static str = "get_task_variable";

    fn validate(&self) -> EngineResult<()> {
        require(&self.task_id, "taskId")?;
        require(&self.variable_name, "variableName")?;
        Ok(())
    }

    fn execute<J: JobStore, T: ScopeStore>(
        &self,
        ctx: &CommandContext<'_, J, T>,
    ) -> EngineResult<Self::Output> {
        let task_id = *require(&self.task_id, "taskId")?;
        let name = require(&self.variable_name, "variableName")?;

        let task = ctx.task(task_id)?;
        ctx.resolve_variable(task.scope_id, name, self.is_local, self.fetch)
    }
}
