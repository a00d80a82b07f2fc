use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use bevy_ecs::prelude::*;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, info_span, warn, Span};

use super::{
    Attachment, Behaviour, BehaviourFamily, REASON_ATTACHMENT_REMOVED, REASON_DEACTIVATED, REASON_DETACHED,
    REASON_ENTITY_DESTROYED, REASON_REPLACED, REASON_SHUTDOWN,
};
use crate::config::LifecycleConfig;
use crate::context::{RuntimeServices, ScriptContext};
use crate::error::{panic_message, BehaviourError, LifecycleHook};
use crate::events::{BehaviourActivated, BehaviourDeactivated};
use crate::scripts::{BehaviourRegistry, BehaviourTemplate};
use crate::time::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unattached,
    Loaded,
    Initialized,
    Active,
    Deactivated,
}

impl LifecycleState {
    fn is_initialized(self) -> bool {
        matches!(self, LifecycleState::Initialized | LifecycleState::Active)
    }
}

/// What one family did during a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FamilyTickReport {
    pub executed: usize,
    pub errored: usize,
    pub activated: usize,
    pub deactivated: usize,
}

impl FamilyTickReport {
    pub fn merge(&mut self, other: &FamilyTickReport) {
        self.executed += other.executed;
        self.errored += other.errored;
        self.activated += other.activated;
        self.deactivated += other.deactivated;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleStats {
    pub executed: u64,
    pub errored: u64,
    pub activations: u64,
    pub deactivations: u64,
}

impl LifecycleStats {
    fn absorb(&mut self, report: &FamilyTickReport) {
        self.executed += report.executed as u64;
        self.errored += report.errored as u64;
        self.activations += report.activated as u64;
        self.deactivations += report.deactivated as u64;
    }
}

struct InstanceSlot {
    instance_id: u64,
    behaviour: String,
    template: Arc<BehaviourTemplate>,
    instance: Box<dyn Behaviour>,
    state: LifecycleState,
    span: Span,
}

fn guarded<T>(behaviour: &str, hook: LifecycleHook, call: impl FnOnce() -> anyhow::Result<T>) -> Result<T, BehaviourError> {
    let message = match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(err)) => format!("{err:#}"),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    Err(BehaviourError::Runtime { id: behaviour.to_string(), hook, message })
}

fn instantiate_guarded(template: &BehaviourTemplate) -> Result<Box<dyn Behaviour>, BehaviourError> {
    catch_unwind(AssertUnwindSafe(|| template.instantiate())).unwrap_or_else(|payload| {
        Err(BehaviourError::Runtime {
            id: template.id().to_string(),
            hook: LifecycleHook::Instantiate,
            message: format!("panicked: {}", panic_message(payload.as_ref())),
        })
    })
}

/// Drives the behaviours of one family (`F`) through their lifecycle.
///
/// Instances live in a side table keyed by entity; the family component on the
/// entity is updated in place with the flags and the last deactivation reason.
pub struct LifecycleManager<F: BehaviourFamily> {
    registry: Arc<BehaviourRegistry>,
    services: RuntimeServices,
    config: LifecycleConfig,
    slots: HashMap<Entity, InstanceSlot>,
    errors: HashMap<Entity, BehaviourError>,
    next_instance_id: u64,
    window: LifecycleStats,
    totals: LifecycleStats,
    over_soft_limit: bool,
    _family: PhantomData<fn() -> F>,
}

impl<F: BehaviourFamily> LifecycleManager<F> {
    pub fn new(registry: Arc<BehaviourRegistry>, services: RuntimeServices, config: LifecycleConfig) -> Self {
        Self {
            registry,
            services,
            config,
            slots: HashMap::new(),
            errors: HashMap::new(),
            next_instance_id: 0,
            window: LifecycleStats::default(),
            totals: LifecycleStats::default(),
            over_soft_limit: false,
            _family: PhantomData,
        }
    }

    pub fn family(&self) -> &'static str {
        F::LABEL
    }

    /// Swaps the registry used for future activations. Running instances keep their templates.
    pub fn set_registry(&mut self, registry: Arc<BehaviourRegistry>) {
        self.registry = registry;
    }

    pub fn registry(&self) -> &Arc<BehaviourRegistry> {
        &self.registry
    }

    pub fn live_instances(&self) -> usize {
        self.slots.len()
    }

    pub fn has_instance(&self, entity: Entity) -> bool {
        self.slots.contains_key(&entity)
    }

    pub fn instance_id(&self, entity: Entity) -> Option<u64> {
        self.slots.get(&entity).map(|slot| slot.instance_id)
    }

    pub fn instance_template(&self, entity: Entity) -> Option<Arc<BehaviourTemplate>> {
        self.slots.get(&entity).map(|slot| Arc::clone(&slot.template))
    }

    /// Last failure that took the entity's behaviour down. Cleared when a new
    /// instance starts and forgotten once the attachment or entity is gone.
    pub fn last_error(&self, entity: Entity) -> Option<&BehaviourError> {
        self.errors.get(&entity)
    }

    pub fn totals(&self) -> LifecycleStats {
        self.totals
    }

    pub fn state(&self, world: &World, entity: Entity) -> LifecycleState {
        if let Some(slot) = self.slots.get(&entity) {
            return slot.state;
        }
        match world.get::<F>(entity) {
            Some(component) => {
                let attachment = component.attachment();
                if !attachment.active || attachment.deactivation_reason.is_some() {
                    LifecycleState::Deactivated
                } else {
                    LifecycleState::Unattached
                }
            }
            None => LifecycleState::Unattached,
        }
    }

    /// Runs one simulation step for every active attachment of this family.
    ///
    /// Entities run in priority order (highest first), ties broken by entity id.
    pub fn tick(&mut self, world: &mut World, frame: Frame) -> FamilyTickReport {
        let mut report = FamilyTickReport::default();
        self.sweep_orphans(world, frame, &mut report);

        let mut query = world.query::<(Entity, &F)>();
        let mut order: Vec<(i32, u64, Entity)> = query
            .iter(world)
            .filter(|(_, component)| component.attachment().active)
            .map(|(entity, component)| (component.attachment().priority, entity.to_bits(), entity))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, _, entity) in order {
            self.step_entity(world, entity, frame, &mut report);
        }

        self.finish(&report);
        self.report_stats(frame);
        report
    }

    /// Tears down the entity's instance before the entity is despawned. `unload`
    /// runs at most once; later calls find nothing to do.
    pub fn on_entity_destroying(&mut self, world: &mut World, entity: Entity, frame: Frame) -> bool {
        if !self.slots.contains_key(&entity) {
            return false;
        }
        let mut report = FamilyTickReport::default();
        let torn_down = self.deactivate(world, entity, frame, REASON_ENTITY_DESTROYED, &mut report);
        self.finish(&report);
        torn_down
    }

    /// Unloads the behaviour and removes the family component from the entity.
    pub fn detach(&mut self, world: &mut World, entity: Entity, frame: Frame) -> bool {
        let mut report = FamilyTickReport::default();
        let attached = self.slots.contains_key(&entity) || world.get::<F>(entity).is_some();
        if attached {
            self.deactivate(world, entity, frame, REASON_DETACHED, &mut report);
            if let Ok(mut entity_mut) = world.get_entity_mut(entity) {
                entity_mut.remove::<F>();
            }
        }
        self.finish(&report);
        attached
    }

    /// Deactivating unloads immediately; activating takes effect on the next tick.
    pub fn set_active(&mut self, world: &mut World, entity: Entity, active: bool, frame: Frame) -> bool {
        if active {
            let Some(mut component) = world.get_mut::<F>(entity) else {
                return false;
            };
            component.attachment_mut().reactivate();
            return true;
        }
        let running = self.slots.contains_key(&entity)
            || world.get::<F>(entity).is_some_and(|component| component.attachment().active);
        if !running {
            return false;
        }
        let mut report = FamilyTickReport::default();
        self.deactivate(world, entity, frame, REASON_DEACTIVATED, &mut report);
        self.finish(&report);
        true
    }

    /// Unloads every live instance. Returns how many were torn down.
    pub fn shutdown(&mut self, world: &mut World, frame: Frame) -> usize {
        let mut entities: Vec<Entity> = self.slots.keys().copied().collect();
        entities.sort_by_key(|entity| entity.to_bits());
        let mut report = FamilyTickReport::default();
        for entity in &entities {
            self.deactivate(world, *entity, frame, REASON_SHUTDOWN, &mut report);
        }
        self.finish(&report);
        entities.len()
    }

    fn finish(&mut self, report: &FamilyTickReport) {
        self.window.absorb(report);
        self.totals.absorb(report);
    }

    fn sweep_orphans(&mut self, world: &mut World, frame: Frame, report: &mut FamilyTickReport) {
        let mut orphans: SmallVec<[(Entity, &'static str); 8]> = self
            .slots
            .keys()
            .filter_map(|&entity| {
                if world.get_entity(entity).is_err() {
                    return Some((entity, REASON_ENTITY_DESTROYED));
                }
                match world.get::<F>(entity) {
                    None => Some((entity, REASON_ATTACHMENT_REMOVED)),
                    Some(component) if !component.attachment().active => Some((entity, REASON_DEACTIVATED)),
                    Some(_) => None,
                }
            })
            .collect();
        orphans.sort_by_key(|(entity, _)| entity.to_bits());
        for (entity, reason) in orphans {
            debug!(family = F::LABEL, entity = ?entity, reason, "sweeping orphaned behaviour");
            self.deactivate(world, entity, frame, reason, report);
        }
    }

    fn step_entity(&mut self, world: &mut World, entity: Entity, frame: Frame, report: &mut FamilyTickReport) {
        let Some(attachment) = world.get::<F>(entity).map(|component| component.attachment().clone()) else {
            return;
        };
        if !attachment.active {
            if self.slots.contains_key(&entity) {
                self.deactivate(world, entity, frame, REASON_DEACTIVATED, report);
            }
            return;
        }

        let wanted = self.registry.normalize_id(&attachment.behaviour);
        if self.slots.get(&entity).is_some_and(|slot| slot.behaviour != wanted) {
            self.deactivate(world, entity, frame, REASON_REPLACED, report);
            if let Some(mut component) = world.get_mut::<F>(entity) {
                component.attachment_mut().reactivate();
            }
        }
        if !self.slots.contains_key(&entity) && !self.activate(world, entity, &attachment, frame, report) {
            return;
        }

        let mut activated: Option<(String, u64)> = None;
        let outcome = {
            let Some(slot) = self.slots.get_mut(&entity) else {
                return;
            };
            let _entered = slot.span.enter();
            let mut outcome = Ok(());
            if slot.state == LifecycleState::Loaded {
                let mut ctx = ScriptContext::for_entity(world, entity, &slot.behaviour, frame, &self.services);
                outcome = guarded(&slot.behaviour, LifecycleHook::Initialize, || slot.instance.initialize(&mut ctx))
                    .and_then(|()| {
                        guarded(&slot.behaviour, LifecycleHook::RegisterEventHandlers, || {
                            slot.instance.register_event_handlers(&mut ctx)
                        })
                    });
                if outcome.is_ok() {
                    slot.state = LifecycleState::Initialized;
                    activated = Some((slot.behaviour.clone(), slot.template.version()));
                }
            }
            if outcome.is_ok() {
                let mut ctx = ScriptContext::for_entity(world, entity, &slot.behaviour, frame, &self.services);
                outcome = guarded(&slot.behaviour, LifecycleHook::Tick, || slot.instance.tick(&mut ctx));
                if outcome.is_ok() {
                    slot.state = LifecycleState::Active;
                }
            }
            outcome
        };

        if let Some((behaviour, version)) = activated {
            if let Some(mut component) = world.get_mut::<F>(entity) {
                component.attachment_mut().initialized = true;
            }
            report.activated += 1;
            debug!(family = F::LABEL, entity = ?entity, behaviour = %behaviour, version, "behaviour activated");
            self.services.bus.publish(&mut BehaviourActivated {
                entity,
                family: F::LABEL,
                behaviour,
                version,
                at: Instant::now(),
            });
        }

        match outcome {
            Ok(()) => report.executed += 1,
            Err(err) => {
                report.errored += 1;
                warn!(
                    family = F::LABEL,
                    entity = ?entity,
                    behaviour = %wanted,
                    tick = frame.tick,
                    hook = ?err.hook(),
                    error = %err,
                    "behaviour failed; deactivating"
                );
                let reason = err.deactivation_reason();
                self.errors.insert(entity, err);
                self.deactivate(world, entity, frame, &reason, report);
            }
        }
    }

    fn activate(
        &mut self,
        world: &mut World,
        entity: Entity,
        attachment: &Attachment,
        frame: Frame,
        report: &mut FamilyTickReport,
    ) -> bool {
        let template = match self.registry.load(&attachment.behaviour) {
            Ok(template) => template,
            Err(err) => {
                warn!(
                    family = F::LABEL,
                    entity = ?entity,
                    behaviour = %attachment.behaviour,
                    tick = frame.tick,
                    error = %err,
                    "behaviour unavailable; deactivating"
                );
                let reason = err.deactivation_reason();
                self.errors.insert(entity, err);
                self.deactivate(world, entity, frame, &reason, report);
                return false;
            }
        };
        let instance = match instantiate_guarded(&template) {
            Ok(instance) => instance,
            Err(err) => {
                warn!(
                    family = F::LABEL,
                    entity = ?entity,
                    behaviour = %template.id(),
                    tick = frame.tick,
                    hook = ?err.hook(),
                    error = %err,
                    "behaviour instantiation failed; deactivating"
                );
                let reason = err.deactivation_reason();
                self.errors.insert(entity, err);
                self.deactivate(world, entity, frame, &reason, report);
                return false;
            }
        };

        self.next_instance_id += 1;
        let instance_id = self.next_instance_id;
        let span = info_span!(
            "behaviour",
            family = F::LABEL,
            behaviour = %template.id(),
            entity = ?entity,
            instance = instance_id
        );
        self.slots.insert(
            entity,
            InstanceSlot {
                instance_id,
                behaviour: template.id().to_string(),
                template,
                instance,
                state: LifecycleState::Loaded,
                span,
            },
        );
        self.errors.remove(&entity);
        if let Some(mut component) = world.get_mut::<F>(entity) {
            let attachment = component.attachment_mut();
            attachment.instance_id = Some(instance_id);
            attachment.initialized = false;
            attachment.deactivation_reason = None;
        }
        self.check_soft_limit();
        true
    }

    /// Shared teardown: `unload` if initialized, drop the instance (and with it every
    /// subscription it owns), clear the flags, record the reason, announce it.
    fn deactivate(
        &mut self,
        world: &mut World,
        entity: Entity,
        frame: Frame,
        reason: &str,
        report: &mut FamilyTickReport,
    ) -> bool {
        let slot = self.slots.remove(&entity);
        let behaviour = match (&slot, world.get::<F>(entity)) {
            (Some(slot), _) => slot.behaviour.clone(),
            (None, Some(component)) => component.attachment().behaviour.clone(),
            (None, None) => return false,
        };

        if let Some(mut slot) = slot {
            if slot.state.is_initialized() {
                let _entered = slot.span.enter();
                let mut ctx = ScriptContext::for_entity(world, entity, &slot.behaviour, frame, &self.services);
                if let Err(err) = guarded(&slot.behaviour, LifecycleHook::Unload, || slot.instance.unload(&mut ctx)) {
                    warn!(
                        family = F::LABEL,
                        entity = ?entity,
                        behaviour = %slot.behaviour,
                        tick = frame.tick,
                        hook = %LifecycleHook::Unload,
                        error = %err,
                        "unload failed; continuing teardown"
                    );
                    self.errors.insert(entity, err);
                }
            }
        }

        if let Some(mut component) = world.get_mut::<F>(entity) {
            component.attachment_mut().mark_deactivated(reason);
        }
        if matches!(reason, REASON_ENTITY_DESTROYED | REASON_DETACHED | REASON_ATTACHMENT_REMOVED) {
            self.errors.remove(&entity);
        }
        report.deactivated += 1;
        info!(family = F::LABEL, entity = ?entity, behaviour = %behaviour, tick = frame.tick, reason, "behaviour deactivated");
        self.services.bus.publish(&mut BehaviourDeactivated {
            entity,
            family: F::LABEL,
            behaviour,
            reason: reason.to_string(),
            at: Instant::now(),
        });
        self.check_soft_limit();
        true
    }

    fn check_soft_limit(&mut self) {
        let live = self.slots.len();
        let limit = self.config.instance_soft_limit;
        if live > limit {
            if !self.over_soft_limit {
                warn!(family = F::LABEL, live, limit, "live behaviour instances above soft limit");
                self.over_soft_limit = true;
            }
        } else {
            self.over_soft_limit = false;
        }
    }

    fn report_stats(&mut self, frame: Frame) {
        let interval = self.config.stats_interval_ticks;
        if interval == 0 || frame.tick % interval != 0 {
            return;
        }
        info!(
            family = F::LABEL,
            tick = frame.tick,
            executed = self.window.executed,
            errored = self.window.errored,
            activations = self.window.activations,
            deactivations = self.window.deactivations,
            live = self.slots.len(),
            "behaviour stats"
        );
        self.window = LifecycleStats::default();
    }
}
