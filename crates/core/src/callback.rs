//! Callback descriptors and the registry that invokes them
//!
//! A [`CallbackDescriptor`] names a target type, an operation and two
//! parameter bags: `params` build an instance, `method_params` go to the
//! operation itself. The process that receives a fire notification resolves
//! the names through its own [`CallbackRegistry`], so neither side needs the
//! other's code beyond a shared type name and parameter shape.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// Errors raised while decoding or invoking a callback
#[derive(Debug, Error)]
pub enum CallbackError {
    /// Required fields missing or of the wrong shape
    #[error("malformed callback: {0}")]
    Malformed(String),

    /// Type or operation not present in the registry
    #[error("unknown callback target '{0}'")]
    UnknownTarget(String),

    /// Construction params did not fit the registered instance type
    #[error("failed to construct {class_name} from params: {source}")]
    Construction {
        class_name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Handler returned an error
    #[error("callback {target} failed: {source}")]
    Failed {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    /// Handler panicked
    #[error("callback {target} panicked: {message}")]
    Panicked { target: String, message: String },
}

/// Serializable description of a deferred invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackDescriptor {
    /// Registered type name
    pub class_name: String,
    /// Type-level operation or instance method
    pub method_name: String,
    /// Construction parameters
    #[serde(default)]
    pub params: Value,
    /// Invocation parameters
    #[serde(default)]
    pub method_params: Value,
}

impl CallbackDescriptor {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            params: Value::Null,
            method_params: Value::Null,
        }
    }

    /// Describe a method call on an instance rebuilt from `instance`'s fields
    pub fn for_instance<T: Serialize>(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        instance: &T,
    ) -> Result<Self, CallbackError> {
        let params = serde_json::to_value(instance)
            .map_err(|e| CallbackError::Malformed(format!("instance params: {}", e)))?;
        Ok(Self::new(class_name, method_name).with_params(params))
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_method_params(mut self, method_params: Value) -> Self {
        self.method_params = method_params;
        self
    }

    /// `Type#method`, used in logs and errors
    pub fn target(&self) -> String {
        format!("{}#{}", self.class_name, self.method_name)
    }

    /// Serialize to JSON bytes
    ///
    /// Object keys come out sorted, so equal descriptors give equal bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CallbackError> {
        serde_json::to_vec(self).map_err(|e| CallbackError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CallbackError> {
        serde_json::from_slice(bytes).map_err(|e| CallbackError::Malformed(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self, CallbackError> {
        serde_json::from_value(value).map_err(|e| CallbackError::Malformed(e.to_string()))
    }
}

impl fmt::Display for CallbackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.method_name)
    }
}

type StaticHandler = Box<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;
type MethodHandler = Box<dyn Fn(&Value, &Value) -> Result<(), MethodFailure> + Send + Sync>;

enum MethodFailure {
    Construction(serde_json::Error),
    Failed(anyhow::Error),
}

/// Operations registered under one type name
#[derive(Default)]
struct TargetType {
    statics: HashMap<String, StaticHandler>,
    methods: HashMap<String, MethodHandler>,
}

/// Per-process table of invocable callback targets
///
/// Filled in once at startup, then shared (usually behind an `Arc`) with the
/// proxy that replays fire notifications.
#[derive(Default)]
pub struct CallbackRegistry {
    targets: HashMap<String, TargetType>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type-level operation, invoked with `method_params`
    pub fn register_static<F>(&mut self, class_name: &str, op: &str, handler: F) -> &mut Self
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.targets
            .entry(class_name.to_string())
            .or_default()
            .statics
            .insert(op.to_string(), Box::new(handler));
        self
    }

    /// Register an instance method
    ///
    /// The instance is deserialized from the descriptor's `params`; the
    /// handler receives it along with `method_params`.
    pub fn register_method<T, F>(&mut self, class_name: &str, method: &str, handler: F) -> &mut Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let wrapped = move |params: &Value, method_params: &Value| {
            let instance = T::deserialize(params).map_err(MethodFailure::Construction)?;
            handler(instance, method_params).map_err(MethodFailure::Failed)
        };
        self.targets
            .entry(class_name.to_string())
            .or_default()
            .methods
            .insert(method.to_string(), Box::new(wrapped));
        self
    }

    /// Whether `class_name` has an operation or method called `op`
    pub fn contains(&self, class_name: &str, op: &str) -> bool {
        self.targets
            .get(class_name)
            .map(|t| t.statics.contains_key(op) || t.methods.contains_key(op))
            .unwrap_or(false)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Resolve and run a descriptor
    ///
    /// Type-level operations win over instance methods of the same name.
    pub fn invoke(&self, descriptor: &CallbackDescriptor) -> Result<(), CallbackError> {
        let target = self
            .targets
            .get(&descriptor.class_name)
            .ok_or_else(|| CallbackError::UnknownTarget(descriptor.class_name.clone()))?;

        if let Some(op) = target.statics.get(&descriptor.method_name) {
            return guard(descriptor, || op(&descriptor.method_params)).and_then(|result| {
                result.map_err(|source| CallbackError::Failed {
                    target: descriptor.target(),
                    source,
                })
            });
        }

        let method = target
            .methods
            .get(&descriptor.method_name)
            .ok_or_else(|| CallbackError::UnknownTarget(descriptor.target()))?;

        match guard(descriptor, || method(&descriptor.params, &descriptor.method_params))? {
            Ok(()) => Ok(()),
            Err(MethodFailure::Construction(source)) => Err(CallbackError::Construction {
                class_name: descriptor.class_name.clone(),
                source,
            }),
            Err(MethodFailure::Failed(source)) => Err(CallbackError::Failed {
                target: descriptor.target(),
                source,
            }),
        }
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.targets.keys().collect();
        names.sort();
        f.debug_struct("CallbackRegistry").field("targets", &names).finish()
    }
}

/// Run a handler, turning a panic into an error
fn guard<R>(descriptor: &CallbackDescriptor, f: impl FnOnce() -> R) -> Result<R, CallbackError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        CallbackError::Panicked {
            target: descriptor.target(),
            message,
        }
    })
}
