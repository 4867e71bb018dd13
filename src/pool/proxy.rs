use dashmap::DashMap;
use serde_json::Value;
use std::any::TypeId;
use std::sync::Arc;
use tracing::debug;

use crate::core::errors::{Result, WeftError};

use super::registry::ClassRegistry;
use super::scheduler::Target;
use super::transport::PendingReply;
use super::PoolHandle;

/// Call-forwarding stand-in for a worker-executable class.
///
/// Exposes the class's method names and a single `invoke` entry point;
/// every invocation becomes an Execute packet submitted to the scheduler,
/// with the returned future settled by the correlated Result or Error.
pub struct WorkerProxy {
    class: String,
    methods: &'static [&'static str],
    type_id: TypeId,
    handle: PoolHandle,
}

impl WorkerProxy {
    pub fn class_name(&self) -> &str {
        &self.class
    }

    pub fn methods(&self) -> &'static [&'static str] {
        self.methods
    }

    /// Type-identity check against the original class: true exactly when
    /// this proxy was generated for `T`.
    pub fn is<T: 'static>(&self) -> bool {
        TypeId::of::<T>() == self.type_id
    }

    /// Forward `method(args)` to any available worker.
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> PendingReply {
        self.invoke_on(Target::Any, method, args)
    }

    /// Forward `method(args)` to a specific target.
    pub fn invoke_on(&self, target: Target, method: &str, args: Vec<Value>) -> PendingReply {
        if !self.methods.contains(&method) {
            return PendingReply::settled(Err(WeftError::MethodNotFound {
                target: self.class.clone(),
                method: method.to_string(),
            }));
        }
        debug!(class = %self.class, method, ?target, "proxy dispatch");
        self.handle.submit(target, &self.class, method, args)
    }
}

/// Generates proxies for registered worker classes, memoized per class:
/// repeated calls for the same class return the identical stand-in.
pub struct ProxyFactory {
    classes: Arc<ClassRegistry>,
    handle: PoolHandle,
    cache: DashMap<String, Arc<WorkerProxy>>,
}

impl ProxyFactory {
    pub(crate) fn new(classes: Arc<ClassRegistry>, handle: PoolHandle) -> Self {
        Self {
            classes,
            handle,
            cache: DashMap::new(),
        }
    }

    /// Build (or fetch the cached) proxy for `class`. Requesting a class
    /// that was never registered is a configuration error, not a silent
    /// local instance: a caller fooled into running on the coordinator
    /// would block it.
    pub fn create(&self, class: &str) -> Result<Arc<WorkerProxy>> {
        if let Some(proxy) = self.cache.get(class) {
            return Ok(Arc::clone(&proxy));
        }
        let entry = self.classes.get(class).ok_or_else(|| {
            WeftError::configuration(format!(
                "Cannot create proxy: class '{}' is not registered",
                class
            ))
        })?;
        let proxy = self
            .cache
            .entry(class.to_string())
            .or_insert_with(|| {
                Arc::new(WorkerProxy {
                    class: class.to_string(),
                    methods: entry.methods(),
                    type_id: entry.type_id(),
                    handle: self.handle.clone(),
                })
            })
            .clone();
        Ok(proxy)
    }
}
