//! Model capability
//!
//! The orchestration core never performs inference. It calls whatever sits
//! behind this trait and treats the call as blocking request/response.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::CapabilityError;
use crate::task::{Artifact, ContextEntry};

/// A model that turns a prompt plus context into an artifact
#[async_trait]
pub trait Model: Send + Sync {
    /// Registry name of this model
    fn name(&self) -> &str;

    /// Run one request
    async fn invoke(
        &self,
        prompt: &str,
        context: &[ContextEntry],
    ) -> std::result::Result<Artifact, CapabilityError>;
}

/// Named model instances available to a coordinator
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn Model>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model under its own name, replacing any previous entry
    pub fn register(&mut self, model: Arc<dyn Model>) {
        info!("Registering model: {}", model.name());
        self.models.insert(model.name().to_string(), model);
    }

    pub fn with(mut self, model: Arc<dyn Model>) -> Self {
        self.register(model);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Model>> {
        self.models.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
