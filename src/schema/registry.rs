//! Schema activation and the entity registry
//!
//! A [`SchemaModule`] names a logical schema, lists the modules it depends
//! on and declares its entities. Activating it under a prefix binds the
//! namespace `prefix + name`, activating dependencies first (same prefix,
//! declaration order). The registry is an explicit handle: create one,
//! populate it by activation, pass it to the record store.
//!
//! Activation of a namespace is exclusive: the namespace is marked
//! in-progress while its definitions are built, and its entities are
//! published in one step once they all validate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, info_span, warn};

use super::{Entity, EntityDefinition};
use crate::config::DEFAULT_LOCK_TIMEOUT;
use crate::{Error, Result};

/// A schema declaration: logical name, dependencies, entities.
pub trait SchemaModule: Send + Sync {
    /// Logical schema name, e.g. `"session"`.
    fn name(&self) -> &str;

    /// Modules that must be active first, in activation order.
    fn dependencies(&self) -> Vec<ActivationHandle> {
        Vec::new()
    }

    /// Define this schema's entities.
    ///
    /// # Errors
    ///
    /// Returns the first definition error.
    fn declare(&self, schema: &mut SchemaBuilder<'_>) -> Result<()>;
}

/// Shared handle to a schema module
pub type ActivationHandle = Arc<dyn SchemaModule>;

/// An activated schema and its published entity descriptors.
#[derive(Debug, PartialEq, Eq)]
pub struct SchemaHandle {
    name: String,
    namespace: String,
    dependencies: Vec<String>,
    entities: Vec<Arc<Entity>>,
}

impl SchemaHandle {
    /// Logical schema name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace the schema is bound to.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Namespaces of direct dependencies.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Top-level entities in declaration order.
    #[must_use]
    pub fn entities(&self) -> &[Arc<Entity>] {
        &self.entities
    }

    /// Look up an entity by name; parts as `Master.Part`.
    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&Arc<Entity>> {
        match name.split_once('.') {
            Some((master, part)) => self
                .entities
                .iter()
                .find(|e| e.name() == master)
                .and_then(|m| m.part(part)),
            None => self.entities.iter().find(|e| e.name() == name),
        }
    }

    /// Like [`entity`](Self::entity), failing with `UnknownEntity`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` if the schema has no such entity.
    pub fn get(&self, name: &str) -> Result<Arc<Entity>> {
        self.entity(name)
            .cloned()
            .ok_or_else(|| Error::UnknownEntity(format!("{}.{name}", self.namespace)))
    }
}

/// Declaration context handed to [`SchemaModule::declare`].
pub struct SchemaBuilder<'a> {
    registry: &'a SchemaRegistry,
    name: String,
    namespace: String,
    dependencies: Vec<Arc<SchemaHandle>>,
    entities: Vec<Arc<Entity>>,
}

impl SchemaBuilder<'_> {
    /// Namespace being declared.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// An activated dependency, by logical name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` if the module did not list that dependency.
    pub fn dependency(&self, name: &str) -> Result<Arc<SchemaHandle>> {
        self.dependencies
            .iter()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| {
                Error::UnknownEntity(format!(
                    "schema `{name}` is not a dependency of `{}`",
                    self.name
                ))
            })
    }

    /// An entity already defined in this schema.
    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&Arc<Entity>> {
        self.entities.iter().find(|e| e.name() == name)
    }

    /// Validate and define an entity (and its parts) in this schema.
    ///
    /// Every reference target must already be active in the registry or
    /// defined earlier in this schema.
    ///
    /// # Errors
    ///
    /// Returns `SchemaDefinition` on any violation.
    pub fn define(&mut self, definition: EntityDefinition) -> Result<Arc<Entity>> {
        let name = definition.name().to_string();
        if self.entity(&name).is_some() {
            return Err(Error::definition(&name, format!("already defined in `{}`", self.namespace)));
        }
        let local = &self.entities;
        let registry = self.registry;
        let resolve = |target: &Entity| -> Result<()> {
            let known_locally = local
                .iter()
                .flat_map(|e| std::iter::once(e).chain(e.parts().iter()))
                .any(|e| e.as_ref() == target);
            if known_locally || registry.entity(target.qualified_name()).is_some_and(|e| *e == *target) {
                Ok(())
            } else {
                Err(Error::definition(
                    &name,
                    format!("reference to `{}`, which is not activated", target.qualified_name()),
                ))
            }
        };
        let entity = definition.build(&self.namespace, &resolve)?;
        debug!(entity = %entity.qualified_name(), parts = entity.parts().len(), "entity defined");
        self.entities.push(Arc::clone(&entity));
        Ok(entity)
    }
}

/// A registered entity and its position in the global lock order.
#[derive(Debug, Clone)]
pub struct RegisteredEntity {
    entity: Arc<Entity>,
    ordinal: u64,
}

impl RegisteredEntity {
    /// Descriptor.
    #[must_use]
    pub const fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    /// Registration order; every reference target has a smaller ordinal
    /// than the entities referencing it.
    #[must_use]
    pub const fn ordinal(&self) -> u64 {
        self.ordinal
    }
}

#[derive(Default)]
struct State {
    schemas: HashMap<String, Arc<SchemaHandle>>,
    order: Vec<String>,
    logical: HashMap<String, String>,
    entities: HashMap<String, RegisteredEntity>,
    dependents: HashMap<String, Vec<Arc<Entity>>>,
    in_progress: HashSet<String>,
    next_ordinal: u64,
}

impl State {
    fn register(&mut self, entity: &Arc<Entity>) {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        for fk in entity.foreign_keys() {
            let dependents = self.dependents.entry(fk.target().to_string()).or_default();
            // Two references to the same target still list the entity once.
            if !dependents.iter().any(|d| Arc::ptr_eq(d, entity)) {
                dependents.push(Arc::clone(entity));
            }
        }
        self.entities.insert(
            entity.qualified_name().to_string(),
            RegisteredEntity {
                entity: Arc::clone(entity),
                ordinal,
            },
        );
        for part in entity.parts() {
            self.register(part);
        }
    }
}

struct Inner {
    state: Mutex<State>,
    activated: Condvar,
    lock_timeout: Duration,
}

/// Registry of activated schemas and their entities.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SchemaRegistry {
    inner: Arc<Inner>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("namespaces", &self.namespaces())
            .field("lock_timeout", &self.inner.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl SchemaRegistry {
    /// Create an empty registry with the given bounded lock wait.
    #[must_use]
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                activated: Condvar::new(),
                lock_timeout,
            }),
        }
    }

    /// Bounded lock wait used by this registry.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        self.inner.lock_timeout
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // State is only mutated after all fallible work is done.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Activate `module` under `prefix`, dependencies first.
    ///
    /// Idempotent: re-activating with identical definitions returns the
    /// existing handle.
    ///
    /// # Errors
    ///
    /// - `DependencyCycle` if the module (transitively) depends on itself
    /// - `AlreadyActiveConflict` if the schema is active with a different definition
    /// - `LockTimeout` if another activation of the namespace does not finish in time
    /// - `SchemaDefinition` for invalid entity definitions
    pub fn activate(&self, prefix: &str, module: &ActivationHandle) -> Result<Arc<SchemaHandle>> {
        self.activate_path(prefix, module, &mut Vec::new())
    }

    fn activate_path(
        &self,
        prefix: &str,
        module: &ActivationHandle,
        path: &mut Vec<String>,
    ) -> Result<Arc<SchemaHandle>> {
        let namespace = format!("{prefix}{}", module.name());
        if path.contains(&namespace) {
            let mut cycle = path.clone();
            cycle.push(namespace);
            warn!(path = ?cycle, "schema dependency cycle");
            return Err(Error::DependencyCycle { path: cycle });
        }

        let span = info_span!("activate", namespace = %namespace);
        let _enter = span.enter();

        let existing = self.claim(&namespace)?;
        let claimed = existing.is_none();
        let result = self.declare_and_publish(prefix, module, &namespace, existing, path);
        if claimed {
            let mut state = self.state();
            state.in_progress.remove(&namespace);
            drop(state);
            self.inner.activated.notify_all();
        }
        result
    }

    /// Wait (bounded) until no other activation of `namespace` is running;
    /// then either return the active handle or mark the namespace in
    /// progress.
    fn claim(&self, namespace: &str) -> Result<Option<Arc<SchemaHandle>>> {
        let timeout = self.inner.lock_timeout;
        let (mut state, wait) = self
            .inner
            .activated
            .wait_timeout_while(self.state(), timeout, |s| s.in_progress.contains(namespace))
            .unwrap_or_else(PoisonError::into_inner);
        if wait.timed_out() && state.in_progress.contains(namespace) {
            warn!(namespace, ?timeout, "timed out waiting for concurrent activation");
            return Err(Error::LockTimeout {
                resource: namespace.to_string(),
                waited: timeout,
            });
        }
        if let Some(handle) = state.schemas.get(namespace) {
            return Ok(Some(Arc::clone(handle)));
        }
        state.in_progress.insert(namespace.to_string());
        Ok(None)
    }

    fn declare_and_publish(
        &self,
        prefix: &str,
        module: &ActivationHandle,
        namespace: &str,
        existing: Option<Arc<SchemaHandle>>,
        path: &mut Vec<String>,
    ) -> Result<Arc<SchemaHandle>> {
        path.push(namespace.to_string());
        let mut dependencies = Vec::new();
        for dependency in module.dependencies() {
            match self.activate_path(prefix, &dependency, path) {
                Ok(handle) => dependencies.push(handle),
                Err(e) => {
                    path.pop();
                    return Err(e);
                }
            }
        }
        path.pop();

        let mut builder = SchemaBuilder {
            registry: self,
            name: module.name().to_string(),
            namespace: namespace.to_string(),
            dependencies,
            entities: Vec::new(),
        };
        module.declare(&mut builder)?;
        let SchemaBuilder {
            name,
            dependencies,
            entities,
            ..
        } = builder;

        if let Some(existing) = existing {
            if existing.entities == entities {
                debug!("schema already active with identical definitions");
                return Ok(existing);
            }
            warn!("schema re-activated with a different definition");
            return Err(Error::AlreadyActiveConflict {
                schema: name,
                active: namespace.to_string(),
                requested: namespace.to_string(),
            });
        }

        let mut state = self.state();
        if let Some(active) = state.logical.get(&name).filter(|ns| *ns != namespace) {
            let compatible = state.schemas.get(active).is_some_and(|handle| {
                handle.entities.len() == entities.len()
                    && handle
                        .entities
                        .iter()
                        .zip(&entities)
                        .all(|(a, b)| a.signature() == b.signature())
            });
            if !compatible {
                warn!(active = %active, "logical schema already active with a different definition");
                return Err(Error::AlreadyActiveConflict {
                    schema: name,
                    active: active.clone(),
                    requested: namespace.to_string(),
                });
            }
        }

        for entity in &entities {
            state.register(entity);
        }
        let handle = Arc::new(SchemaHandle {
            name: name.clone(),
            namespace: namespace.to_string(),
            dependencies: dependencies.iter().map(|d| d.namespace.clone()).collect(),
            entities,
        });
        state.schemas.insert(namespace.to_string(), Arc::clone(&handle));
        state.order.push(namespace.to_string());
        state.logical.entry(name).or_insert_with(|| namespace.to_string());
        info!(entities = handle.entities.len(), "schema activated");
        Ok(handle)
    }

    /// Handle of an active namespace.
    #[must_use]
    pub fn schema(&self, namespace: &str) -> Option<Arc<SchemaHandle>> {
        self.state().schemas.get(namespace).cloned()
    }

    /// Whether the namespace is active.
    #[must_use]
    pub fn is_active(&self, namespace: &str) -> bool {
        self.state().schemas.contains_key(namespace)
    }

    /// Active namespaces in activation order.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.state().order.clone()
    }

    /// Descriptor of a registered entity, by qualified name.
    #[must_use]
    pub fn entity(&self, qualified_name: &str) -> Option<Arc<Entity>> {
        self.state()
            .entities
            .get(qualified_name)
            .map(|r| Arc::clone(&r.entity))
    }

    /// Registered entity with its lock ordinal.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` if the entity is not registered.
    pub fn registered(&self, qualified_name: &str) -> Result<RegisteredEntity> {
        self.state()
            .entities
            .get(qualified_name)
            .cloned()
            .ok_or_else(|| Error::UnknownEntity(qualified_name.to_string()))
    }

    /// Entities holding a foreign key to `qualified_name` (parts included).
    #[must_use]
    pub fn dependents(&self, qualified_name: &str) -> Vec<Arc<Entity>> {
        self.state()
            .dependents
            .get(qualified_name)
            .cloned()
            .unwrap_or_default()
    }
}
