use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bevy_ecs::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use super::{AttachedScript, Attachment, BehaviourFamily, FamilyTickReport, LifecycleManager, NpcBehaviour, TileBehaviour};
use crate::api::ScriptApis;
use crate::config::{LifecycleConfig, RuntimeConfig};
use crate::context::{RuntimeServices, ScriptLogLine};
use crate::ecs::EcsWorld;
use crate::error::BehaviourError;
use crate::events::{EntityDestroying, EventBus};
use crate::script_watch::ScriptWatcher;
use crate::scripts::BehaviourRegistry;
use crate::time::{Frame, TickClock};

/// Per-family results of one [`BehaviourRuntime::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub tick: u64,
    pub tiles: FamilyTickReport,
    pub npcs: FamilyTickReport,
    pub scripts: FamilyTickReport,
    pub despawned: usize,
}

impl TickSummary {
    pub fn total(&self) -> FamilyTickReport {
        let mut total = self.tiles;
        total.merge(&self.npcs);
        total.merge(&self.scripts);
        total
    }
}

/// Bundles the bus, the registry and one lifecycle manager per behaviour family.
///
/// Families tick in a fixed order: tiles, NPCs, then attached scripts. Despawns
/// requested during the tick are applied afterwards through [`Self::destroy_entity`].
pub struct BehaviourRuntime {
    services: RuntimeServices,
    registry: Arc<BehaviourRegistry>,
    tiles: LifecycleManager<TileBehaviour>,
    npcs: LifecycleManager<NpcBehaviour>,
    scripts: LifecycleManager<AttachedScript>,
    clock: TickClock,
}

impl BehaviourRuntime {
    pub fn new(config: &RuntimeConfig, apis: ScriptApis) -> Self {
        let registry = Arc::new(BehaviourRegistry::new(&config.scripts));
        let services = RuntimeServices::new(EventBus::new(), apis, config.scripts.seed);
        Self::with_parts(registry, services, config.lifecycle.clone())
    }

    pub fn headless(config: &RuntimeConfig) -> Self {
        Self::new(config, ScriptApis::headless())
    }

    pub fn with_parts(registry: Arc<BehaviourRegistry>, services: RuntimeServices, lifecycle: LifecycleConfig) -> Self {
        Self {
            tiles: LifecycleManager::new(Arc::clone(&registry), services.clone(), lifecycle.clone()),
            npcs: LifecycleManager::new(Arc::clone(&registry), services.clone(), lifecycle.clone()),
            scripts: LifecycleManager::new(Arc::clone(&registry), services.clone(), lifecycle),
            registry,
            services,
            clock: TickClock::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.services.bus
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    pub fn registry(&self) -> &Arc<BehaviourRegistry> {
        &self.registry
    }

    pub fn tiles(&self) -> &LifecycleManager<TileBehaviour> {
        &self.tiles
    }

    pub fn tiles_mut(&mut self) -> &mut LifecycleManager<TileBehaviour> {
        &mut self.tiles
    }

    pub fn npcs(&self) -> &LifecycleManager<NpcBehaviour> {
        &self.npcs
    }

    pub fn npcs_mut(&mut self) -> &mut LifecycleManager<NpcBehaviour> {
        &mut self.npcs
    }

    pub fn scripts(&self) -> &LifecycleManager<AttachedScript> {
        &self.scripts
    }

    pub fn scripts_mut(&mut self) -> &mut LifecycleManager<AttachedScript> {
        &mut self.scripts
    }

    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    /// Frame of the last completed tick, used for calls made between ticks.
    pub fn frame(&self) -> Frame {
        self.clock.current_frame()
    }

    pub fn live_instances(&self) -> usize {
        self.tiles.live_instances() + self.npcs.live_instances() + self.scripts.live_instances()
    }

    /// Points every family at `registry`. Instances already running keep their templates.
    pub fn set_registry(&mut self, registry: Arc<BehaviourRegistry>) {
        self.tiles.set_registry(Arc::clone(&registry));
        self.npcs.set_registry(Arc::clone(&registry));
        self.scripts.set_registry(Arc::clone(&registry));
        self.registry = registry;
    }

    /// Inserts (or replaces) the family component `F` on `entity`.
    pub fn attach<F: BehaviourFamily>(&self, ecs: &mut EcsWorld, entity: Entity, attachment: Attachment) -> bool {
        match ecs.world.get_entity_mut(entity) {
            Ok(mut entity_mut) => {
                entity_mut.insert(F::from_attachment(attachment));
                true
            }
            Err(_) => false,
        }
    }

    pub fn tick(&mut self, ecs: &mut EcsWorld, dt: f32) -> TickSummary {
        let frame = self.clock.advance(dt);
        let tiles = self.tiles.tick(&mut ecs.world, frame);
        let npcs = self.npcs.tick(&mut ecs.world, frame);
        let scripts = self.scripts.tick(&mut ecs.world, frame);
        let despawned = self.process_despawns(ecs, frame);
        TickSummary { tick: frame.tick, tiles, npcs, scripts, despawned }
    }

    /// Unloads every behaviour on `entity`, announces the destruction, then despawns it.
    pub fn destroy_entity(&mut self, ecs: &mut EcsWorld, entity: Entity) -> bool {
        let frame = self.clock.current_frame();
        self.destroy_entity_at(ecs, entity, frame)
    }

    fn destroy_entity_at(&mut self, ecs: &mut EcsWorld, entity: Entity, frame: Frame) -> bool {
        if !ecs.entity_exists(entity) {
            return false;
        }
        self.tiles.on_entity_destroying(&mut ecs.world, entity, frame);
        self.npcs.on_entity_destroying(&mut ecs.world, entity, frame);
        self.scripts.on_entity_destroying(&mut ecs.world, entity, frame);
        self.services.bus.publish(&mut EntityDestroying { entity, at: Instant::now() });
        ecs.despawn_entity(entity)
    }

    fn process_despawns(&mut self, ecs: &mut EcsWorld, frame: Frame) -> usize {
        let mut despawned = 0;
        loop {
            let pending = self.services.despawns.drain();
            if pending.is_empty() {
                break;
            }
            for entity in pending {
                if self.destroy_entity_at(ecs, entity, frame) {
                    despawned += 1;
                }
            }
        }
        despawned
    }

    /// Unloads every live behaviour in every family.
    pub fn shutdown(&mut self, ecs: &mut EcsWorld) -> usize {
        let frame = self.clock.current_frame();
        let unloaded = self.tiles.shutdown(&mut ecs.world, frame)
            + self.npcs.shutdown(&mut ecs.world, frame)
            + self.scripts.shutdown(&mut ecs.world, frame);
        info!(unloaded, tick = frame.tick, "behaviour runtime shut down");
        unloaded
    }

    pub fn take_logs(&self) -> Vec<ScriptLogLine> {
        self.services.logs.take()
    }

    /// Recompiles every cached behaviour whose source is one of `paths`. New
    /// activations pick up the new version; running instances are left alone.
    pub fn reload_changed(&self, paths: &[PathBuf]) -> Vec<(String, Result<u64, BehaviourError>)> {
        let mut results = Vec::new();
        for path in paths {
            for id in self.registry.ids_for_path(path) {
                let result = self.registry.reload(&id).map(|template| template.version());
                if let Err(err) = &result {
                    warn!(behaviour = %id, error = %err, "reload failed");
                }
                results.push((id, result));
            }
        }
        results
    }

    pub fn apply_script_changes(&self, watcher: &mut ScriptWatcher) -> Vec<(String, Result<u64, BehaviourError>)> {
        let changes = watcher.drain_changes();
        if changes.is_empty() {
            return Vec::new();
        }
        self.reload_changed(&changes)
    }
}
