//! Factory registry and live session registry.

use crate::datamodel::{DataModel, ExprDataModel, NullDataModel};
use crate::error::InterpreterError;
use crate::service::{EventSink, ExecutableContent, Invoker, IoProcessor};
use crate::session_invoker::{SessionInvoker, SESSION_INVOKER_TYPES};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// What a factory gets to wire a new component to its session.
#[derive(Clone)]
pub struct ServiceContext {
    pub sink: EventSink,
    pub registry: Arc<Registry>,
    pub sessions: Option<Arc<SessionRegistry>>,
}

pub trait DataModelFactory: Send + Sync {
    fn create(&self, ctx: &ServiceContext) -> Box<dyn DataModel>;
}

pub trait InvokerFactory: Send + Sync {
    fn create(&self, ctx: &ServiceContext) -> Box<dyn Invoker>;
}

pub trait IoProcessorFactory: Send + Sync {
    fn create(&self, ctx: &ServiceContext) -> Box<dyn IoProcessor>;
}

pub trait ExecutableContentFactory: Send + Sync {
    fn create(&self, ctx: &ServiceContext) -> Box<dyn ExecutableContent>;
}

impl<F> DataModelFactory for F
where
    F: Fn(&ServiceContext) -> Box<dyn DataModel> + Send + Sync,
{
    fn create(&self, ctx: &ServiceContext) -> Box<dyn DataModel> {
        self(ctx)
    }
}

impl<F> InvokerFactory for F
where
    F: Fn(&ServiceContext) -> Box<dyn Invoker> + Send + Sync,
{
    fn create(&self, ctx: &ServiceContext) -> Box<dyn Invoker> {
        self(ctx)
    }
}

impl<F> IoProcessorFactory for F
where
    F: Fn(&ServiceContext) -> Box<dyn IoProcessor> + Send + Sync,
{
    fn create(&self, ctx: &ServiceContext) -> Box<dyn IoProcessor> {
        self(ctx)
    }
}

impl<F> ExecutableContentFactory for F
where
    F: Fn(&ServiceContext) -> Box<dyn ExecutableContent> + Send + Sync,
{
    fn create(&self, ctx: &ServiceContext) -> Box<dyn ExecutableContent> {
        self(ctx)
    }
}

/// Named factories. Lookups fall back to the parent registry.
///
/// Registries are filled at startup and then shared read-only, typically
/// behind an `Arc` handed to every session.
#[derive(Default)]
pub struct Registry {
    parent: Option<Arc<Registry>>,
    data_models: HashMap<String, Arc<dyn DataModelFactory>>,
    invokers: HashMap<String, Arc<dyn InvokerFactory>>,
    io_processors: HashMap<String, Arc<dyn IoProcessorFactory>>,
    executable_content: HashMap<String, Arc<dyn ExecutableContentFactory>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The `expr` and `null` data models and the nested session invoker.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_data_model("expr", |_: &ServiceContext| {
            Box::new(ExprDataModel::new()) as Box<dyn DataModel>
        });
        registry.register_data_model("null", |_: &ServiceContext| {
            Box::new(NullDataModel::default()) as Box<dyn DataModel>
        });
        for name in SESSION_INVOKER_TYPES {
            registry.register_invoker(name, |ctx: &ServiceContext| {
                Box::new(SessionInvoker::new(ctx.clone())) as Box<dyn Invoker>
            });
        }
        registry
    }

    /// An empty registry that delegates to `parent`.
    pub fn with_parent(parent: Arc<Registry>) -> Self {
        Self {
            parent: Some(parent),
            ..Default::default()
        }
    }

    pub fn parent(&self) -> Option<&Arc<Registry>> {
        self.parent.as_ref()
    }

    pub fn register_data_model(
        &mut self,
        name: impl Into<String>,
        factory: impl DataModelFactory + 'static,
    ) {
        self.data_models.insert(name.into(), Arc::new(factory));
    }

    pub fn register_invoker(
        &mut self,
        name: impl Into<String>,
        factory: impl InvokerFactory + 'static,
    ) {
        self.invokers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_io_processor(
        &mut self,
        name: impl Into<String>,
        factory: impl IoProcessorFactory + 'static,
    ) {
        self.io_processors.insert(name.into(), Arc::new(factory));
    }

    pub fn register_executable_content(
        &mut self,
        name: impl Into<String>,
        factory: impl ExecutableContentFactory + 'static,
    ) {
        self.executable_content.insert(name.into(), Arc::new(factory));
    }

    fn find<T: ?Sized>(
        &self,
        table: fn(&Registry) -> &HashMap<String, Arc<T>>,
        name: &str,
    ) -> Option<Arc<T>> {
        let mut current = Some(self);
        while let Some(registry) = current {
            if let Some(factory) = table(registry).get(name) {
                return Some(Arc::clone(factory));
            }
            current = registry.parent.as_deref();
        }
        None
    }

    pub fn has_data_model(&self, name: &str) -> bool {
        self.find(|r| &r.data_models, name).is_some()
    }

    pub fn has_invoker(&self, name: &str) -> bool {
        self.find(|r| &r.invokers, name).is_some()
    }

    pub fn has_io_processor(&self, name: &str) -> bool {
        self.find(|r| &r.io_processors, name).is_some()
    }

    pub fn has_executable_content(&self, name: &str) -> bool {
        self.find(|r| &r.executable_content, name).is_some()
    }

    pub fn create_data_model(
        &self,
        name: &str,
        ctx: &ServiceContext,
    ) -> Result<Box<dyn DataModel>, InterpreterError> {
        self.find(|r| &r.data_models, name)
            .map(|f| f.create(ctx))
            .ok_or_else(|| unsupported("data model", name))
    }

    pub fn create_invoker(
        &self,
        name: &str,
        ctx: &ServiceContext,
    ) -> Result<Box<dyn Invoker>, InterpreterError> {
        self.find(|r| &r.invokers, name)
            .map(|f| f.create(ctx))
            .ok_or_else(|| unsupported("invoker", name))
    }

    pub fn create_io_processor(
        &self,
        name: &str,
        ctx: &ServiceContext,
    ) -> Result<Box<dyn IoProcessor>, InterpreterError> {
        self.find(|r| &r.io_processors, name)
            .map(|f| f.create(ctx))
            .ok_or_else(|| unsupported("I/O processor", name))
    }

    pub fn create_executable_content(
        &self,
        name: &str,
        ctx: &ServiceContext,
    ) -> Result<Box<dyn ExecutableContent>, InterpreterError> {
        self.find(|r| &r.executable_content, name)
            .map(|f| f.create(ctx))
            .ok_or_else(|| unsupported("executable content", name))
    }

    /// Names of all I/O processor types, including inherited ones.
    pub fn io_processor_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let mut current = Some(self);
        while let Some(registry) = current {
            names.extend(registry.io_processors.keys().cloned());
            current = registry.parent.as_deref();
        }
        names
    }
}

fn unsupported(kind: &'static str, name: &str) -> InterpreterError {
    InterpreterError::Unsupported {
        kind,
        name: name.to_string(),
    }
}

/// Event sinks of live sessions, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, EventSink>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: EventSink) {
        tracing::debug!(session = %sink.session_id(), "session registered");
        self.sessions.insert(sink.session_id().to_string(), sink);
    }

    pub fn unregister(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            tracing::debug!(session = %session_id, "session unregistered");
        }
        removed
    }

    pub fn lookup(&self, session_id: &str) -> Option<EventSink> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statecraft_core::Event;
    use statecraft_queue::EventQueue;

    struct Recorder;

    impl IoProcessor for Recorder {
        fn send(&mut self, _target: Option<&str>, _event: Event) -> Result<(), InterpreterError> {
            Ok(())
        }
    }

    fn context(registry: Arc<Registry>) -> ServiceContext {
        ServiceContext {
            sink: EventSink::new("s", EventQueue::new(), EventQueue::new()),
            registry,
            sessions: None,
        }
    }

    #[test]
    fn test_builtin_registry() {
        let registry = Arc::new(Registry::builtin());
        assert!(registry.has_data_model("expr"));
        assert!(registry.has_data_model("null"));
        assert!(registry.has_invoker("scxml"));
        assert!(!registry.has_io_processor("basichttp"));

        let ctx = context(Arc::clone(&registry));
        let dm = registry.create_data_model("expr", &ctx).unwrap();
        assert_eq!(dm.name(), "expr");
        assert!(matches!(
            registry.create_data_model("ecmascript", &ctx),
            Err(InterpreterError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_parent_delegation() {
        let parent = Arc::new(Registry::builtin());
        let mut child = Registry::with_parent(Arc::clone(&parent));
        child.register_io_processor("recorder", |_: &ServiceContext| {
            Box::new(Recorder) as Box<dyn IoProcessor>
        });
        let child = Arc::new(child);

        assert!(child.has_data_model("expr"));
        assert!(child.has_io_processor("recorder"));
        assert!(!parent.has_io_processor("recorder"));
        assert_eq!(
            child.io_processor_names().into_iter().collect::<Vec<_>>(),
            vec!["recorder".to_string()]
        );
        assert!(child.create_io_processor("recorder", &context(Arc::clone(&child))).is_ok());
    }

    #[test]
    fn test_child_entries_shadow_parent() {
        let parent = Arc::new(Registry::builtin());
        let mut child = Registry::with_parent(parent);
        child.register_data_model("expr", |_: &ServiceContext| {
            Box::new(NullDataModel::default()) as Box<dyn DataModel>
        });
        let child = Arc::new(child);
        let dm = child
            .create_data_model("expr", &context(Arc::clone(&child)))
            .unwrap();
        assert_eq!(dm.name(), "null");
    }

    #[test]
    fn test_session_registry() {
        let sessions = SessionRegistry::new();
        let external = EventQueue::new();
        sessions.register(EventSink::new("a", EventQueue::new(), external.clone()));
        sessions.register(EventSink::new("b", EventQueue::new(), EventQueue::new()));
        assert_eq!(sessions.session_ids(), vec!["a", "b"]);

        sessions.lookup("a").unwrap().send(Event::external("hi"));
        assert_eq!(external.try_dequeue().unwrap().name, "hi");

        assert!(sessions.unregister("a"));
        assert!(!sessions.unregister("a"));
        assert!(sessions.lookup("a").is_none());
        assert_eq!(sessions.len(), 1);
    }
}
