//! Name-keyed service container.
//!
//! - Providers register an implementation once under a unique service name.
//! - Consumers fetch by name and *interface type*: `get::<dyn my::Api>("my.api")`.
//! - Value = `Arc<T>` stored as `Box<dyn Any + Send + Sync>` (downcast on read).
//!
//! Module-owned services are staged by the registration pipeline and stay
//! invisible (`NotReady`) until the owning module completes Stage 1. If the
//! owner fails instead, its staged services are discarded.

use parking_lot::RwLock;
use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use crate::descriptor::{MethodContract, ServiceSpec};

type Boxed = Box<dyn Any + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceOwner {
    /// Registered directly by the embedding application.
    Host,
    Module(String),
}

impl ServiceOwner {
    pub fn module_id(&self) -> Option<&str> {
        match self {
            ServiceOwner::Host => None,
            ServiceOwner::Module(id) => Some(id),
        }
    }
}

impl fmt::Display for ServiceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceOwner::Host => f.write_str("host"),
            ServiceOwner::Module(id) => write!(f, "module '{id}'"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("service '{name}' is already registered by {owner}")]
    AlreadyRegistered { name: String, owner: ServiceOwner },

    #[error("service '{name}' not found")]
    NotFound { name: String },

    #[error("service '{name}' is not ready: {owner} has not completed stage 1")]
    NotReady { name: String, owner: ServiceOwner },

    #[error("type mismatch for service '{name}': requested {requested}, registered {registered}")]
    TypeMismatch {
        name: String,
        requested: &'static str,
        registered: &'static str,
    },
}

/// An instance a module hands over at creation time, keyed by service name.
pub struct ServiceInstance {
    name: String,
    type_name: &'static str,
    value: Boxed,
}

impl ServiceInstance {
    pub fn new<T>(name: impl Into<String>, instance: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            type_name: std::any::type_name::<T>(),
            value: Box::new(instance),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .finish()
    }
}

/// Introspection view of one container entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub name: String,
    pub owner: ServiceOwner,
    pub priority: i32,
    pub methods: Vec<MethodContract>,
    pub type_name: &'static str,
    pub ready: bool,
}

struct Slot {
    registration: ServiceRegistration,
    value: Boxed,
}

pub struct ServiceContainer {
    map: RwLock<HashMap<String, Slot>>,
}

impl ServiceContainer {
    #[inline]
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceContainer {
    /// Register a host-owned service; it is visible immediately.
    /// `T` can be a trait object like `dyn my_module::contract::MyApi`.
    pub fn register<T>(
        &self,
        name: impl Into<String>,
        instance: Arc<T>,
        priority: i32,
    ) -> Result<(), ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let instance = ServiceInstance::new(name, instance);
        let registration = ServiceRegistration {
            name: instance.name.clone(),
            owner: ServiceOwner::Host,
            priority,
            methods: Vec::new(),
            type_name: instance.type_name,
            ready: true,
        };
        self.insert(registration, instance.value)
    }

    /// Stage a module-owned service; `get` reports `NotReady` until [`Self::publish_owner`].
    pub(crate) fn stage(
        &self,
        owner: &str,
        spec: &ServiceSpec,
        instance: ServiceInstance,
    ) -> Result<(), ContainerError> {
        let registration = ServiceRegistration {
            name: spec.name.clone(),
            owner: ServiceOwner::Module(owner.to_string()),
            priority: spec.priority,
            methods: spec.methods.clone(),
            type_name: instance.type_name,
            ready: false,
        };
        self.insert(registration, instance.value)
    }

    fn insert(&self, registration: ServiceRegistration, value: Boxed) -> Result<(), ContainerError> {
        let mut w = self.map.write();
        if let Some(existing) = w.get(&registration.name) {
            return Err(ContainerError::AlreadyRegistered {
                name: registration.name,
                owner: existing.registration.owner.clone(),
            });
        }
        w.insert(registration.name.clone(), Slot { registration, value });
        Ok(())
    }

    /// Make every staged service of `owner` visible; returns their names.
    pub(crate) fn publish_owner(&self, owner: &str) -> Vec<String> {
        let mut w = self.map.write();
        let mut published: Vec<String> = w
            .values_mut()
            .filter(|s| !s.registration.ready && s.registration.owner.module_id() == Some(owner))
            .map(|s| {
                s.registration.ready = true;
                s.registration.name.clone()
            })
            .collect();
        published.sort();
        published
    }

    /// Drop every still-staged service of `owner`; returns how many were removed.
    pub(crate) fn discard_owner(&self, owner: &str) -> usize {
        let mut w = self.map.write();
        let before = w.len();
        w.retain(|_, s| s.registration.ready || s.registration.owner.module_id() != Some(owner));
        before - w.len()
    }

    /// Fetch a ready service by name and interface type `T`.
    pub fn get<T>(&self, name: &str) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let r = self.map.read();
        let slot = r.get(name).ok_or_else(|| ContainerError::NotFound {
            name: name.to_string(),
        })?;

        if !slot.registration.ready {
            return Err(ContainerError::NotReady {
                name: name.to_string(),
                owner: slot.registration.owner.clone(),
            });
        }

        // Stored value is exactly `Arc<T>` for the registered T.
        if let Some(arc_t) = slot.value.downcast_ref::<Arc<T>>() {
            return Ok(arc_t.clone());
        }
        Err(ContainerError::TypeMismatch {
            name: name.to_string(),
            requested: std::any::type_name::<T>(),
            registered: slot.registration.type_name,
        })
    }

    /// Whether a service with this name exists, ready or staged.
    pub fn contains(&self, name: &str) -> bool {
        self.map.read().contains_key(name)
    }

    pub fn owner_of(&self, name: &str) -> Option<ServiceOwner> {
        self.map.read().get(name).map(|s| s.registration.owner.clone())
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.map
            .read()
            .get(name)
            .is_some_and(|s| s.registration.ready)
    }

    /// All registrations ordered by priority, then name.
    pub fn describe(&self) -> Vec<ServiceRegistration> {
        let mut all: Vec<ServiceRegistration> = self
            .map
            .read()
            .values()
            .map(|s| s.registration.clone())
            .collect();
        all.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        all
    }

    /// Drop everything (teardown, tests).
    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

/// Lazily-resolved handle to a named service, handed out through injection.
///
/// Resolution happens on every [`ServiceRef::get`], so a reference obtained
/// before the provider finished Stage 1 starts working once it has.
#[derive(Clone)]
pub struct ServiceRef {
    name: String,
    container: Arc<ServiceContainer>,
}

impl ServiceRef {
    pub(crate) fn new(name: impl Into<String>, container: Arc<ServiceContainer>) -> Self {
        Self {
            name: name.into(),
            container,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get<T>(&self) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.container.get::<T>(&self.name)
    }
}

impl fmt::Debug for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceRef").field(&self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_trait::async_trait]
    trait TestApi: Send + Sync {
        async fn id(&self) -> usize;
    }

    struct ImplA(usize);
    #[async_trait::async_trait]
    impl TestApi for ImplA {
        async fn id(&self) -> usize {
            self.0
        }
    }

    #[tokio::test]
    async fn register_and_get_dyn_trait() {
        let c = ServiceContainer::new();
        let api: Arc<dyn TestApi> = Arc::new(ImplA(7));
        c.register::<dyn TestApi>("test.api", api.clone(), 10).unwrap();

        let got = c.get::<dyn TestApi>("test.api").unwrap();
        assert_eq!(got.id().await, 7);
        assert!(Arc::ptr_eq(&api, &got));
    }

    #[test]
    fn re_registration_is_rejected() {
        let c = ServiceContainer::new();
        c.register("svc", Arc::new(1u32), 0).unwrap();
        let err = c.register("svc", Arc::new(2u32), 0).unwrap_err();
        assert!(matches!(
            err,
            ContainerError::AlreadyRegistered { owner: ServiceOwner::Host, .. }
        ));
        assert_eq!(*c.get::<u32>("svc").unwrap(), 1);
    }

    #[test]
    fn staged_service_is_not_ready_until_published() {
        let c = ServiceContainer::new();
        c.stage("core.a", &ServiceSpec::new("a.svc"), ServiceInstance::new("a.svc", Arc::new(5u8)))
            .unwrap();

        assert!(matches!(
            c.get::<u8>("a.svc"),
            Err(ContainerError::NotReady { .. })
        ));
        assert!(c.contains("a.svc"));

        assert_eq!(c.publish_owner("core.a"), vec!["a.svc".to_string()]);
        assert_eq!(*c.get::<u8>("a.svc").unwrap(), 5);
    }

    #[test]
    fn discard_removes_only_staged_entries_of_owner() {
        let c = ServiceContainer::new();
        c.stage("m", &ServiceSpec::new("one"), ServiceInstance::new("one", Arc::new(1i32)))
            .unwrap();
        c.stage("other", &ServiceSpec::new("two"), ServiceInstance::new("two", Arc::new(2i32)))
            .unwrap();

        assert_eq!(c.discard_owner("m"), 1);
        assert!(matches!(c.get::<i32>("one"), Err(ContainerError::NotFound { .. })));
        assert!(c.contains("two"));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let c = ServiceContainer::new();
        c.register("num", Arc::new(1u64), 0).unwrap();
        let err = c.get::<String>("num").unwrap_err();
        assert!(matches!(err, ContainerError::TypeMismatch { .. }));
    }

    #[test]
    fn describe_orders_by_priority_then_name() {
        let c = ServiceContainer::new();
        c.register("b", Arc::new(()), 5).unwrap();
        c.register("a", Arc::new(()), 5).unwrap();
        c.register("z", Arc::new(()), 1).unwrap();
        let names: Vec<_> = c.describe().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["z", "a", "b"]);
    }

    #[test]
    fn service_ref_resolves_lazily() {
        let c = Arc::new(ServiceContainer::new());
        let r = ServiceRef::new("late", c.clone());
        assert!(r.get::<u16>().is_err());
        c.register("late", Arc::new(3u16), 0).unwrap();
        assert_eq!(*r.get::<u16>().unwrap(), 3);
    }
}
