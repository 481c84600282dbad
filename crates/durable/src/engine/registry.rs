//! Workflow registry for type-erased replay
//!
//! The registry maps workflow type names to factories that build a replay
//! machine for the concrete type, so the executor can drive any registered
//! workflow from its history alone.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::replay::{AnyExecution, ReplayConfig, ReplayMachine};
use crate::workflow::Workflow;

/// Factory function type for creating replay machines
pub type WorkflowFactory = Box<dyn Fn(ReplayConfig) -> Box<dyn AnyExecution> + Send + Sync>;

type InputCheck = Box<dyn Fn(&Value) -> Result<(), serde_json::Error> + Send + Sync>;

struct Registration {
    factory: WorkflowFactory,
    check_input: InputCheck,
}

/// Registry of workflow types
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Registration>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type
    ///
    /// Registering the same type name again replaces the earlier entry.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register::<OrderWorkflow>();
    /// ```
    pub fn register<W: Workflow>(&mut self) -> &mut Self {
        let factory: WorkflowFactory =
            Box::new(|config: ReplayConfig| Box::new(ReplayMachine::<W>::new(config)) as Box<dyn AnyExecution>);
        let check_input: InputCheck = Box::new(|input: &Value| {
            serde_json::from_value::<W::Input>(input.clone()).map(|_| ())
        });

        self.workflows.insert(
            W::TYPE.to_string(),
            Registration {
                factory,
                check_input,
            },
        );
        self
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    /// Build an empty replay machine for a workflow type
    pub fn create(
        &self,
        workflow_type: &str,
        config: ReplayConfig,
    ) -> Result<Box<dyn AnyExecution>, RegistryError> {
        let registration = self.lookup(workflow_type)?;
        Ok((registration.factory)(config))
    }

    /// Check that `input` deserializes into the workflow's input type
    pub fn check_input(&self, workflow_type: &str, input: &Value) -> Result<(), RegistryError> {
        let registration = self.lookup(workflow_type)?;
        (registration.check_input)(input).map_err(RegistryError::Deserialization)
    }

    fn lookup(&self, workflow_type: &str) -> Result<&Registration, RegistryError> {
        self.workflows
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Failed to deserialize workflow input
    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}
