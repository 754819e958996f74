use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

/// Something that can run a job's `data`.
///
/// Implemented for plain closures, so both of these register:
///
/// ```ignore
/// registry.register("Ping", |_: &Map<String, Value>| -> anyhow::Result<()> { Ok(()) });
/// registry.register("SendEmail", SendEmail::new(mailer));
/// ```
pub trait JobHandler: Send + Sync {
    fn handle(&self, data: &Map<String, Value>) -> anyhow::Result<()>;
}

impl<F> JobHandler for F
where
    F: Fn(&Map<String, Value>) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, data: &Map<String, Value>) -> anyhow::Result<()> {
        self(data)
    }
}

/// Maps the `job` identifier stored in a payload to the handler that runs it.
///
/// Built once at startup and shared read-only with workers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, handler: impl JobHandler + 'static) -> &mut Self {
        let name = name.into();
        debug!(%name, "job handler registered");
        self.handlers.insert(name, Arc::new(handler));
        self
    }

    /// Register a handler that takes its arguments as a typed struct.
    ///
    /// Data that doesn't deserialize into `T` fails the job like any other
    /// handler error.
    pub fn register_typed<T, F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(name, move |data: &Map<String, Value>| -> anyhow::Result<()> {
            let args: T = serde_json::from_value(Value::Object(data.clone()))?;
            f(args)
        })
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
