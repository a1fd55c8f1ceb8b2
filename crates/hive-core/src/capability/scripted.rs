//! Scripted capabilities
//!
//! Replay a fixed sequence of replies. Used for deterministic replays, dry
//! runs from the CLI, and tests. Once the script is exhausted the last reply
//! repeats.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::{CapabilityError, Model, Tool};
use crate::task::{Artifact, ContextEntry};

/// One scripted reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedReply {
    Ok(JsonValue),
    Fail(String),
}

impl ScriptedReply {
    fn into_result(self) -> std::result::Result<JsonValue, CapabilityError> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Fail(reason) => Err(CapabilityError::new(reason)),
        }
    }
}

#[derive(Debug)]
struct Script {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<Vec<String>>,
}

impl Script {
    fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn next(&self, call: String) -> std::result::Result<JsonValue, CapabilityError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let mut replies = self
            .replies
            .lock()
            .map_err(|_| CapabilityError::new("script lock poisoned"))?;
        let reply = if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        };
        reply
            .ok_or_else(|| CapabilityError::new("script has no replies"))?
            .into_result()
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

/// Model replaying scripted replies in order
#[derive(Debug)]
pub struct ScriptedModel {
    name: String,
    script: Script,
}

impl ScriptedModel {
    pub fn new(name: impl Into<String>, replies: Vec<ScriptedReply>) -> Self {
        Self {
            name: name.into(),
            script: Script::new(replies),
        }
    }

    /// Model that always returns `reply`
    pub fn always(name: impl Into<String>, reply: JsonValue) -> Self {
        Self::new(name, vec![ScriptedReply::Ok(reply)])
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.script.calls()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        prompt: &str,
        _context: &[ContextEntry],
    ) -> std::result::Result<Artifact, CapabilityError> {
        self.script.next(prompt.to_string())
    }
}

/// Tool replaying scripted replies in order
#[derive(Debug)]
pub struct ScriptedTool {
    name: String,
    script: Script,
}

impl ScriptedTool {
    pub fn new(name: impl Into<String>, replies: Vec<ScriptedReply>) -> Self {
        Self {
            name: name.into(),
            script: Script::new(replies),
        }
    }

    pub fn always(name: impl Into<String>, reply: JsonValue) -> Self {
        Self::new(name, vec![ScriptedReply::Ok(reply)])
    }

    /// Actions received so far
    pub fn actions(&self) -> Vec<String> {
        self.script.calls()
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted tool"
    }

    async fn invoke(
        &self,
        action: &str,
        _args: &JsonValue,
    ) -> std::result::Result<JsonValue, CapabilityError> {
        self.script.next(action.to_string())
    }
}
