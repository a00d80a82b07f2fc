use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bevy_ecs::prelude::*;
use bevy_ecs::world::Mut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};

use crate::api::ScriptApis;
use crate::error::ContextError;
use crate::events::{Cancellable, DispatchReport, Event, EventBus, Subscription, Verdict};
use crate::time::Frame;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLogLevel {
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptLogLine {
    pub tick: u64,
    #[serde(skip)]
    pub entity: Option<Entity>,
    pub behaviour: String,
    pub level: ScriptLogLevel,
    pub message: String,
}

impl fmt::Display for ScriptLogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            ScriptLogLevel::Info => "info",
            ScriptLogLevel::Warn => "warn",
        };
        write!(f, "[{}:{}] {}", self.behaviour, level, self.message)
    }
}

/// Captures behaviour log output alongside the `tracing` events so tools can inspect it.
#[derive(Debug, Clone, Default)]
pub struct ScriptLogSink {
    lines: Arc<Mutex<Vec<ScriptLogLine>>>,
}

impl ScriptLogSink {
    pub fn push(&self, line: ScriptLogLine) {
        lock(&self.lines).push(line);
    }

    pub fn len(&self) -> usize {
        lock(&self.lines).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<ScriptLogLine> {
        std::mem::take(&mut *lock(&self.lines))
    }
}

/// Entities a behaviour asked to remove. Drained by the runtime after each tick so
/// teardown always runs through the destruction hook.
#[derive(Debug, Clone, Default)]
pub struct DespawnQueue {
    pending: Arc<Mutex<Vec<Entity>>>,
}

impl DespawnQueue {
    pub fn request(&self, entity: Entity) {
        let mut pending = lock(&self.pending);
        if !pending.contains(&entity) {
            pending.push(entity);
        }
    }

    pub fn drain(&self) -> Vec<Entity> {
        std::mem::take(&mut *lock(&self.pending))
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }
}

/// RNG shared by every behaviour so a seeded run replays identically.
#[derive(Debug, Clone)]
pub struct SharedRng {
    rng: Arc<Mutex<StdRng>>,
}

impl SharedRng {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng: Arc::new(Mutex::new(rng)) }
    }

    /// Uniform integer in `[min, max)`. Degenerate ranges return `min`.
    pub fn range_i64(&self, min: i64, max: i64) -> i64 {
        if max <= min {
            return min;
        }
        lock(&self.rng).gen_range(min..max)
    }

    pub fn range_f64(&self, min: f64, max: f64) -> f64 {
        if max.is_nan() || min.is_nan() || max <= min {
            return min;
        }
        lock(&self.rng).gen_range(min..max)
    }
}

/// Services shared by every behaviour call of a runtime. Cloning shares them.
#[derive(Clone)]
pub struct RuntimeServices {
    pub bus: EventBus,
    pub apis: ScriptApis,
    pub logs: ScriptLogSink,
    pub despawns: DespawnQueue,
    pub rng: SharedRng,
}

impl RuntimeServices {
    pub fn new(bus: EventBus, apis: ScriptApis, seed: Option<u64>) -> Self {
        Self { bus, apis, logs: ScriptLogSink::default(), despawns: DespawnQueue::default(), rng: SharedRng::new(seed) }
    }

    pub fn headless(seed: Option<u64>) -> Self {
        Self::new(EventBus::new(), ScriptApis::headless(), seed)
    }

    pub(crate) fn record_log(
        &self,
        frame: Frame,
        entity: Option<Entity>,
        behaviour: &str,
        level: ScriptLogLevel,
        message: &str,
    ) {
        match level {
            ScriptLogLevel::Info => info!(behaviour, entity = ?entity, tick = frame.tick, "{message}"),
            ScriptLogLevel::Warn => warn!(behaviour, entity = ?entity, tick = frame.tick, "{message}"),
        }
        self.logs.push(ScriptLogLine {
            tick: frame.tick,
            entity,
            behaviour: behaviour.to_string(),
            level,
            message: message.to_string(),
        });
    }
}

/// Per-call view of the world and services handed to a behaviour hook.
///
/// Entity-scoped contexts carry a target entity; global contexts do not, and every
/// state accessor that needs an entity reports [`ContextError::GlobalContext`].
pub struct ScriptContext<'a> {
    world: &'a mut World,
    entity: Option<Entity>,
    behaviour: &'a str,
    frame: Frame,
    services: &'a RuntimeServices,
}

impl<'a> ScriptContext<'a> {
    pub fn for_entity(
        world: &'a mut World,
        entity: Entity,
        behaviour: &'a str,
        frame: Frame,
        services: &'a RuntimeServices,
    ) -> Self {
        Self { world, entity: Some(entity), behaviour, frame, services }
    }

    pub fn global(world: &'a mut World, behaviour: &'a str, frame: Frame, services: &'a RuntimeServices) -> Self {
        Self { world, entity: None, behaviour, frame, services }
    }

    pub fn entity(&self) -> Option<Entity> {
        self.entity
    }

    pub fn is_global(&self) -> bool {
        self.entity.is_none()
    }

    pub fn behaviour_id(&self) -> &str {
        self.behaviour
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn world(&self) -> &World {
        &*self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut *self.world
    }

    pub fn services(&self) -> &RuntimeServices {
        self.services
    }

    pub fn apis(&self) -> &ScriptApis {
        &self.services.apis
    }

    pub fn bus(&self) -> &EventBus {
        &self.services.bus
    }

    fn require_entity(&self, operation: &'static str) -> Result<Entity, ContextError> {
        let entity = self.entity.ok_or(ContextError::GlobalContext { operation })?;
        if self.world.get_entity(entity).is_err() {
            return Err(ContextError::EntityGone { entity });
        }
        Ok(entity)
    }

    pub fn get_state<T: Component>(&self) -> Result<&T, ContextError> {
        let entity = self.require_entity("get_state")?;
        self.world
            .get::<T>(entity)
            .ok_or(ContextError::MissingState { entity, component: std::any::type_name::<T>() })
    }

    pub fn get_state_mut<T: Component>(&mut self) -> Result<Mut<'_, T>, ContextError> {
        let entity = self.require_entity("get_state_mut")?;
        self.world
            .get_mut::<T>(entity)
            .ok_or(ContextError::MissingState { entity, component: std::any::type_name::<T>() })
    }

    pub fn try_get_state<T: Component>(&self) -> Option<&T> {
        self.entity.and_then(|entity| self.world.get::<T>(entity))
    }

    pub fn has_state<T: Component>(&self) -> bool {
        self.try_get_state::<T>().is_some()
    }

    pub fn get_or_add_state<T: Component + Default>(&mut self) -> Result<Mut<'_, T>, ContextError> {
        let entity = self.require_entity("get_or_add_state")?;
        if !self.world.entity(entity).contains::<T>() {
            self.world.entity_mut(entity).insert(T::default());
        }
        self.world
            .get_mut::<T>(entity)
            .ok_or(ContextError::MissingState { entity, component: std::any::type_name::<T>() })
    }

    pub fn set_state<T: Component>(&mut self, value: T) -> Result<(), ContextError> {
        let entity = self.require_entity("set_state")?;
        self.world.entity_mut(entity).insert(value);
        Ok(())
    }

    /// Removes and returns the component. Absent components and global contexts are a no-op.
    pub fn remove_state<T: Component>(&mut self) -> Option<T> {
        let entity = self.entity?;
        let mut entity_mut = self.world.get_entity_mut(entity).ok()?;
        entity_mut.take::<T>()
    }

    /// Same contract as [`EventBus::subscribe`]: the returned handle owns the registration.
    pub fn subscribe<T, F>(&self, handler: F) -> Subscription
    where
        T: Event,
        F: Fn(&mut T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.services.bus.subscribe(handler)
    }

    pub fn publish<T: Event>(&self, event: &mut T) -> DispatchReport {
        self.services.bus.publish(event)
    }

    pub fn publish_cancellable<T: Cancellable>(&self, event: &mut T) -> Verdict {
        self.services.bus.publish_cancellable(event)
    }

    /// Queues the context's entity for destruction after the current tick.
    pub fn request_despawn(&self) -> Result<(), ContextError> {
        let entity = self.entity.ok_or(ContextError::GlobalContext { operation: "request_despawn" })?;
        self.services.despawns.request(entity);
        Ok(())
    }

    pub fn log_info(&self, message: impl AsRef<str>) {
        self.services.record_log(self.frame, self.entity, self.behaviour, ScriptLogLevel::Info, message.as_ref());
    }

    pub fn log_warn(&self, message: impl AsRef<str>) {
        self.services.record_log(self.frame, self.entity, self.behaviour, ScriptLogLevel::Warn, message.as_ref());
    }
}
