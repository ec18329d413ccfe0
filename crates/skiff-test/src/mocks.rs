//! Mock implementations for testing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use skiff_bootstrap::sandbox::{
    ContextId, ContextInstance, SandboxBackend, SandboxEnv, SandboxError, SandboxResult,
};

/// Something a mock context does when it starts or is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MockAction {
    /// Call `require(name)`.
    Require {
        /// Module name to ask for.
        name: String,
    },
    /// Create a loader-internal context.
    LoadNested {
        /// Source location.
        location: Url,
    },
    /// Create a module context.
    LoadModule {
        /// Module id.
        id: String,
        /// Source location.
        location: Url,
    },
}

/// The "source code" of a mock context, stored as JSON where a real
/// context would have a wasm module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockProgram {
    /// Exported entry points.
    #[serde(default)]
    pub exports: Vec<String>,
    /// Actions run as top-level code.
    #[serde(default)]
    pub init: Vec<MockAction>,
    /// Actions run by each export.
    #[serde(default)]
    pub on_call: BTreeMap<String, Vec<MockAction>>,
    /// Make top-level code fail with this message.
    #[serde(default)]
    pub fail_init: Option<String>,
    /// Make an export fail with a message, after running its actions.
    #[serde(default)]
    pub fail: BTreeMap<String, String>,
}

impl MockProgram {
    /// A program with no exports.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A package loader exporting `startup` and `unload`.
    #[must_use]
    pub fn package_loader() -> Self {
        Self::new().with_export("startup").with_export("unload")
    }

    /// A module exporting nothing.
    #[must_use]
    pub fn module() -> Self {
        Self::new()
    }

    /// Add an export.
    #[must_use]
    pub fn with_export(mut self, name: impl Into<String>) -> Self {
        self.exports.push(name.into());
        self
    }

    /// Run `action` as top-level code.
    #[must_use]
    pub fn on_init(mut self, action: MockAction) -> Self {
        self.init.push(action);
        self
    }

    /// Run `action` whenever `export` is called.
    #[must_use]
    pub fn on_call(mut self, export: impl Into<String>, action: MockAction) -> Self {
        self.on_call.entry(export.into()).or_default().push(action);
        self
    }

    /// Load a module whenever `export` is called.
    #[must_use]
    pub fn loading_module(self, export: &str, id: &str, location: &Url) -> Self {
        self.on_call(
            export,
            MockAction::LoadModule {
                id: id.to_owned(),
                location: location.clone(),
            },
        )
    }

    /// Make top-level code fail.
    #[must_use]
    pub fn failing_init(mut self, message: impl Into<String>) -> Self {
        self.fail_init = Some(message.into());
        self
    }

    /// Make an export fail.
    #[must_use]
    pub fn failing(mut self, export: impl Into<String>, message: impl Into<String>) -> Self {
        self.fail.insert(export.into(), message.into());
        self
    }

    /// Serialized program.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }
}

/// What the mock backend observed.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    /// A context was created.
    Instantiated {
        /// The new context.
        context: ContextId,
        /// Where its program came from.
        location: Url,
    },
    /// A context called `require`.
    Required {
        /// Calling context.
        context: ContextId,
        /// Requested name.
        name: String,
        /// Whether the host granted it.
        granted: bool,
    },
    /// An export was called.
    Called {
        /// Called context.
        context: ContextId,
        /// Export name.
        export: String,
        /// Decoded JSON input (`null` if not JSON).
        input: Value,
    },
    /// A context was torn down.
    Destroyed {
        /// The destroyed context.
        context: ContextId,
    },
}

/// Scripted [`SandboxBackend`] recording every lifecycle event.
///
/// Clones share one event log.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    events: Arc<Mutex<Vec<MockEvent>>>,
}

impl MockBackend {
    /// Create a backend with an empty event log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Created contexts with their locations, in creation order.
    #[must_use]
    pub fn instantiated(&self) -> Vec<(ContextId, Url)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Instantiated { context, location } => Some((context, location)),
                _ => None,
            })
            .collect()
    }

    /// The context created from `location`, if any.
    #[must_use]
    pub fn context_for(&self, location: &str) -> Option<ContextId> {
        self.instantiated()
            .into_iter()
            .find(|(_, l)| l.as_str() == location)
            .map(|(id, _)| id)
    }

    /// Inputs of every call to `export`, in order.
    #[must_use]
    pub fn calls(&self, export: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Called {
                    export: name,
                    input,
                    ..
                } if name == export => Some(input),
                _ => None,
            })
            .collect()
    }

    /// Destroyed contexts, in teardown order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<ContextId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Destroyed { context } => Some(context),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: MockEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl SandboxBackend for MockBackend {
    fn instantiate(
        &self,
        location: &Url,
        source: Vec<u8>,
        env: SandboxEnv,
    ) -> SandboxResult<Box<dyn ContextInstance>> {
        let load_error = |message: String| SandboxError::Load {
            location: location.to_string(),
            message,
        };
        let program: MockProgram = serde_json::from_slice(&source)
            .map_err(|e| load_error(format!("not a mock program: {e}")))?;

        let context = env.context();
        self.record(MockEvent::Instantiated {
            context,
            location: location.clone(),
        });
        if let Some(message) = &program.fail_init {
            return Err(load_error(message.clone()));
        }

        let instance = MockInstance {
            program,
            env,
            backend: self.clone(),
        };
        instance
            .run(&instance.program.init)
            .map_err(|e| load_error(e.to_string()))?;
        Ok(Box::new(instance))
    }
}

struct MockInstance {
    program: MockProgram,
    env: SandboxEnv,
    backend: MockBackend,
}

impl MockInstance {
    fn run(&self, actions: &[MockAction]) -> SandboxResult<()> {
        for action in actions {
            match action {
                MockAction::Require { name } => {
                    let granted = self.env.require(name).is_ok();
                    self.backend.record(MockEvent::Required {
                        context: self.env.context(),
                        name: name.clone(),
                        granted,
                    });
                },
                MockAction::LoadNested { location } => {
                    self.env.load_nested(location)?;
                },
                MockAction::LoadModule { id, location } => {
                    self.env.load_module(id, location)?;
                },
            }
        }
        Ok(())
    }
}

impl ContextInstance for MockInstance {
    fn has_export(&self, name: &str) -> bool {
        self.program.exports.iter().any(|e| e == name)
    }

    fn call(&mut self, name: &str, input: &[u8]) -> SandboxResult<Vec<u8>> {
        let context = self.env.context();
        self.backend.record(MockEvent::Called {
            context,
            export: name.to_owned(),
            input: serde_json::from_slice(input).unwrap_or(Value::Null),
        });
        let actions = self.program.on_call.get(name).cloned().unwrap_or_default();
        self.run(&actions)?;
        if let Some(message) = self.program.fail.get(name) {
            return Err(SandboxError::Execution {
                context,
                export: name.to_owned(),
                message: message.clone(),
            });
        }
        Ok(b"null".to_vec())
    }

    fn nuke(&mut self) -> SandboxResult<()> {
        self.backend.record(MockEvent::Destroyed {
            context: self.env.context(),
        });
        Ok(())
    }
}
