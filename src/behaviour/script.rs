//! Rhai-backed behaviours.
//!
//! A script may define any of `init(ctx)`, `register_events(ctx)`, `tick(ctx, dt)`
//! and `unload(ctx)`. Hooks the script does not define are skipped. Per-instance
//! variables live on the [`ScriptHandle`] (`ctx.get_var` / `ctx.set_var`) and are
//! mirrored into the entity's [`ScriptVars`] component after every call. Each hook
//! starts from the component again, so other systems may edit it between ticks;
//! if an event handler changed a variable since the last mirror, the script's copy wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use bevy_ecs::prelude::*;
use glam::IVec2;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, ImmutableString, Scope, FLOAT, INT};
use tracing::debug;

use super::Behaviour;
use crate::context::{RuntimeServices, ScriptContext, ScriptLogLevel};
use crate::ecs::{Direction, TilePosition};
use crate::events::{Cancellable, CustomEvent, Event, MovementRequested, Subscription};
use crate::scripts::ScriptProgram;
use crate::time::Frame;

/// Script variables of one entity, readable by other systems and tools.
#[derive(Component, Debug, Clone, Default)]
pub struct ScriptVars(pub rhai::Map);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn entity_bits(entity: Option<Entity>) -> INT {
    entity.map_or(-1, |entity| entity.to_bits() as INT)
}

/// State shared between an instance and the handles given to its script calls.
#[derive(Default)]
struct InstanceShared {
    vars: Mutex<rhai::Map>,
    /// Set when vars change outside a hook, i.e. from an event handler.
    vars_dirty: AtomicBool,
    frame: Mutex<Frame>,
    tile: Mutex<Option<IVec2>>,
}

/// The `ctx` value scripts receive.
#[derive(Clone)]
pub struct ScriptHandle {
    entity: Option<Entity>,
    behaviour: ImmutableString,
    shared: Arc<InstanceShared>,
    services: RuntimeServices,
    program: Arc<ScriptProgram>,
    /// Present only inside lifecycle hooks; event handlers cannot subscribe.
    subscriptions: Option<Arc<Mutex<Vec<Subscription>>>>,
}

impl ScriptHandle {
    fn frame(&self) -> Frame {
        *lock(&self.shared.frame)
    }

    fn get_entity(&mut self) -> INT {
        entity_bits(self.entity)
    }

    fn get_behaviour(&mut self) -> ImmutableString {
        self.behaviour.clone()
    }

    fn get_tick(&mut self) -> INT {
        self.frame().tick as INT
    }

    fn get_dt(&mut self) -> FLOAT {
        self.frame().dt as FLOAT
    }

    fn get_tile_x(&mut self) -> INT {
        lock(&self.shared.tile).map_or(0, |tile| tile.x as INT)
    }

    fn get_tile_y(&mut self) -> INT {
        lock(&self.shared.tile).map_or(0, |tile| tile.y as INT)
    }

    fn record(&self, level: ScriptLogLevel, message: &str) {
        self.services.record_log(self.frame(), self.entity, &self.behaviour, level, message);
    }

    fn log(&mut self, message: &str) {
        self.record(ScriptLogLevel::Info, message);
    }

    fn warn(&mut self, message: &str) {
        self.record(ScriptLogLevel::Warn, message);
    }

    fn get_var(&mut self, name: &str) -> Dynamic {
        lock(&self.shared.vars).get(name).cloned().unwrap_or(Dynamic::UNIT)
    }

    fn set_var(&mut self, name: &str, value: Dynamic) {
        lock(&self.shared.vars).insert(name.into(), value);
        self.shared.vars_dirty.store(true, Ordering::Release);
    }

    fn has_var(&mut self, name: &str) -> bool {
        lock(&self.shared.vars).contains_key(name)
    }

    fn remove_var(&mut self, name: &str) -> Dynamic {
        let removed = lock(&self.shared.vars).remove(name);
        if removed.is_some() {
            self.shared.vars_dirty.store(true, Ordering::Release);
        }
        removed.unwrap_or(Dynamic::UNIT)
    }

    fn emit(&mut self, event_type: &str) -> Result<bool, Box<EvalAltResult>> {
        self.emit_with(event_type, rhai::Map::new())
    }

    /// Publishes a [`CustomEvent`]; `false` means a handler cancelled it.
    fn emit_with(&mut self, event_type: &str, payload: rhai::Map) -> Result<bool, Box<EvalAltResult>> {
        if event_type.trim().is_empty() {
            return Err("emit: event type must not be empty".into());
        }
        let mut event = CustomEvent::new(event_type).with_payload(payload);
        if let Some(entity) = self.entity {
            event = event.with_source(entity);
        }
        Ok(self.services.bus.publish_cancellable(&mut event).is_proceed())
    }

    /// Routes `CustomEvent`s of `event_type` to the script function `fn_name(ctx, payload)`.
    /// Returning a string from the handler cancels the event with that reason.
    fn subscribe(&mut self, event_type: &str, fn_name: &str) -> Result<(), Box<EvalAltResult>> {
        if event_type.trim().is_empty() {
            return Err("subscribe: event type must not be empty".into());
        }
        let Some(sink) = self.subscriptions.clone() else {
            return Err("subscribe: only available inside lifecycle hooks".into());
        };
        if !self.program.has_function(fn_name, 2) {
            return Err(format!("subscribe: handler '{fn_name}(ctx, payload)' is not defined").into());
        }
        let handle = ScriptHandle { subscriptions: None, ..self.clone() };
        let wanted = event_type.to_string();
        let fn_name = fn_name.to_string();
        let subscription = self.services.bus.subscribe::<CustomEvent, _>(move |event| {
            if event.event_type() != wanted {
                return Ok(());
            }
            let program = Arc::clone(&handle.program);
            let mut scope = Scope::new();
            let result: Dynamic = program
                .engine()
                .call_fn_with_options(
                    CallFnOptions::new().eval_ast(false),
                    &mut scope,
                    program.ast(),
                    &fn_name,
                    (handle.clone(), event.payload.clone()),
                )
                .map_err(|err| anyhow!("{}::{fn_name}: {err}", handle.behaviour))?;
            if let Some(reason) = result.try_cast::<ImmutableString>() {
                event.cancel(reason.to_string());
            }
            Ok(())
        });
        lock(&sink).push(subscription);
        Ok(())
    }

    fn show_message(&mut self, text: &str) {
        self.services.apis.dialogue.show_message(self.entity, text);
    }

    fn player_entity(&mut self) -> INT {
        entity_bits(self.services.apis.player.player_entity())
    }

    fn is_passable(&mut self, x: INT, y: INT) -> bool {
        self.services.apis.map.is_passable(IVec2::new(x as i32, y as i32))
    }

    /// Asks the NPC service to step one tile. Impassable targets and cancelled
    /// `MovementRequested` events refuse the move.
    fn request_move(&mut self, direction: &str) -> Result<bool, Box<EvalAltResult>> {
        let direction =
            Direction::parse(direction).ok_or_else(|| format!("request_move: unknown direction '{direction}'"))?;
        let Some(entity) = self.entity else {
            return Err("request_move: needs an entity-scoped context".into());
        };
        let from = lock(&self.shared.tile).unwrap_or_default();
        let to = from + direction.offset();
        if !self.services.apis.map.is_passable(to) {
            return Ok(false);
        }
        let mut event = MovementRequested::new(entity, from, to);
        if !self.services.bus.publish_cancellable(&mut event).is_proceed() {
            return Ok(false);
        }
        Ok(self.services.apis.npc.request_move(entity, direction))
    }

    fn face(&mut self, direction: &str) -> Result<(), Box<EvalAltResult>> {
        let direction = Direction::parse(direction).ok_or_else(|| format!("face: unknown direction '{direction}'"))?;
        let Some(entity) = self.entity else {
            return Err("face: needs an entity-scoped context".into());
        };
        self.services.apis.npc.face(entity, direction);
        Ok(())
    }

    fn rand_int(&mut self, min: INT, max: INT) -> INT {
        self.services.rng.range_i64(min as i64, max as i64) as INT
    }

    fn rand_float(&mut self, min: FLOAT, max: FLOAT) -> FLOAT {
        self.services.rng.range_f64(min as f64, max as f64) as FLOAT
    }

    /// Queues the entity for destruction after the current tick.
    fn despawn(&mut self) -> bool {
        match self.entity {
            Some(entity) => {
                self.services.despawns.request(entity);
                true
            }
            None => false,
        }
    }
}

pub fn register_script_api(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptHandle>("Context");
    engine.register_get("entity", ScriptHandle::get_entity);
    engine.register_get("behaviour", ScriptHandle::get_behaviour);
    engine.register_get("tick", ScriptHandle::get_tick);
    engine.register_get("dt", ScriptHandle::get_dt);
    engine.register_get("tile_x", ScriptHandle::get_tile_x);
    engine.register_get("tile_y", ScriptHandle::get_tile_y);
    engine.register_fn("log", ScriptHandle::log);
    engine.register_fn("warn", ScriptHandle::warn);
    engine.register_fn("get_var", ScriptHandle::get_var);
    engine.register_fn("set_var", ScriptHandle::set_var);
    engine.register_fn("has_var", ScriptHandle::has_var);
    engine.register_fn("remove_var", ScriptHandle::remove_var);
    engine.register_fn("emit", ScriptHandle::emit);
    engine.register_fn("emit", ScriptHandle::emit_with);
    engine.register_fn("subscribe", ScriptHandle::subscribe);
    engine.register_fn("show_message", ScriptHandle::show_message);
    engine.register_fn("player_entity", ScriptHandle::player_entity);
    engine.register_fn("is_passable", ScriptHandle::is_passable);
    engine.register_fn("request_move", ScriptHandle::request_move);
    engine.register_fn("face", ScriptHandle::face);
    engine.register_fn("rand", ScriptHandle::rand_int);
    engine.register_fn("rand", ScriptHandle::rand_float);
    engine.register_fn("despawn", ScriptHandle::despawn);
}

/// One entity's instance of a compiled script.
pub struct ScriptBehaviour {
    id: ImmutableString,
    program: Arc<ScriptProgram>,
    scope: Scope<'static>,
    shared: Arc<InstanceShared>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl ScriptBehaviour {
    /// Runs the script's top-level statements once for this instance.
    pub fn new(id: &str, program: Arc<ScriptProgram>) -> Result<Self> {
        let mut scope = Scope::new();
        program
            .engine()
            .run_ast_with_scope(&mut scope, program.ast())
            .map_err(|err| anyhow!("top-level statements failed: {err}"))?;
        Ok(Self {
            id: id.into(),
            program,
            scope,
            shared: Arc::new(InstanceShared::default()),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub fn vars(&self) -> rhai::Map {
        lock(&self.shared.vars).clone()
    }

    fn handle(&self, entity: Option<Entity>, services: &RuntimeServices) -> ScriptHandle {
        ScriptHandle {
            entity,
            behaviour: self.id.clone(),
            shared: Arc::clone(&self.shared),
            services: services.clone(),
            program: Arc::clone(&self.program),
            subscriptions: Some(Arc::clone(&self.subscriptions)),
        }
    }

    fn pull_state(&mut self, ctx: &ScriptContext<'_>) {
        if !self.shared.vars_dirty.load(Ordering::Acquire) {
            if let Some(vars) = ctx.try_get_state::<ScriptVars>() {
                *lock(&self.shared.vars) = vars.0.clone();
            }
        }
        *lock(&self.shared.frame) = ctx.frame();
        *lock(&self.shared.tile) = ctx.try_get_state::<TilePosition>().map(|pos| pos.0);
    }

    fn push_state(&self, ctx: &mut ScriptContext<'_>) {
        if ctx.is_global() {
            return;
        }
        let vars = lock(&self.shared.vars).clone();
        if vars.is_empty() && !ctx.has_state::<ScriptVars>() {
            self.shared.vars_dirty.store(false, Ordering::Release);
            return;
        }
        match ctx.set_state(ScriptVars(vars)) {
            Ok(()) => self.shared.vars_dirty.store(false, Ordering::Release),
            Err(err) => debug!(behaviour = %self.id, entity = ?ctx.entity(), error = %err, "script vars not mirrored"),
        }
    }

    fn call_hook(&mut self, ctx: &mut ScriptContext<'_>, name: &str, dt: Option<FLOAT>) -> Result<()> {
        let arity = if dt.is_some() { 2 } else { 1 };
        if !self.program.has_function(name, arity) {
            return Ok(());
        }
        self.pull_state(ctx);
        let handle = self.handle(ctx.entity(), ctx.services());
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let program = Arc::clone(&self.program);
        let result = match dt {
            Some(dt) => program.engine().call_fn_with_options::<Dynamic>(
                options,
                &mut self.scope,
                program.ast(),
                name,
                (handle, dt),
            ),
            None => {
                program.engine().call_fn_with_options::<Dynamic>(options, &mut self.scope, program.ast(), name, (handle,))
            }
        };
        self.push_state(ctx);
        result.map(|_| ()).map_err(|err| anyhow!("{name}: {err}"))
    }
}

impl Behaviour for ScriptBehaviour {
    fn initialize(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        self.call_hook(ctx, "init", None)
    }

    fn register_event_handlers(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        self.call_hook(ctx, "register_events", None)
    }

    fn tick(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        let dt = ctx.frame().dt as FLOAT;
        self.call_hook(ctx, "tick", Some(dt))
    }

    fn unload(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        let result = self.call_hook(ctx, "unload", None);
        lock(&self.subscriptions).clear();
        result
    }
}

impl Drop for ScriptBehaviour {
    fn drop(&mut self) {
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn program(source: &str) -> Arc<ScriptProgram> {
        let mut engine = Engine::new();
        register_script_api(&mut engine);
        Arc::new(ScriptProgram::compile(Arc::new(engine), "test", source).expect("compile"))
    }

    #[test]
    fn top_level_failure_blocks_instantiation() {
        let err = ScriptBehaviour::new("broken", program("throw \"no\";")).err().expect("error");
        assert!(err.to_string().contains("top-level"), "{err}");
    }

    #[test]
    fn vars_mirror_into_component() {
        let mut world = World::new();
        let mut seeded = rhai::Map::new();
        seeded.insert("count".into(), Dynamic::from(4 as INT));
        let entity = world.spawn(ScriptVars(seeded)).id();
        let services = RuntimeServices::headless(Some(3));
        let mut behaviour = ScriptBehaviour::new(
            "counter",
            program("fn tick(ctx, dt) { ctx.set_var(\"count\", ctx.get_var(\"count\") + 1); }"),
        )
        .expect("instantiate");

        for tick in 1..=2 {
            let mut ctx = ScriptContext::for_entity(&mut world, entity, "counter", Frame { tick, dt: 0.1 }, &services);
            behaviour.tick(&mut ctx).expect("tick");
        }
        let vars = world.get::<ScriptVars>(entity).expect("vars");
        assert_eq!(vars.0.get("count").and_then(|value| value.as_int().ok()), Some(6));
    }

    #[test]
    fn external_var_edits_are_seen_by_the_next_hook() {
        let mut world = World::new();
        let entity = world.spawn(ScriptVars::default()).id();
        let services = RuntimeServices::headless(None);
        let mut behaviour = ScriptBehaviour::new(
            "counter",
            program("fn tick(ctx, dt) { let n = if ctx.has_var(\"count\") { ctx.get_var(\"count\") } else { 0 }; ctx.set_var(\"count\", n + 1); }"),
        )
        .expect("instantiate");

        let mut ctx = ScriptContext::for_entity(&mut world, entity, "counter", Frame { tick: 1, dt: 0.1 }, &services);
        behaviour.tick(&mut ctx).expect("first tick");
        world.get_mut::<ScriptVars>(entity).expect("vars").0.insert("count".into(), Dynamic::from(100 as INT));

        let mut ctx = ScriptContext::for_entity(&mut world, entity, "counter", Frame { tick: 2, dt: 0.1 }, &services);
        behaviour.tick(&mut ctx).expect("second tick");
        let vars = world.get::<ScriptVars>(entity).expect("vars");
        assert_eq!(vars.0.get("count").and_then(|value| value.as_int().ok()), Some(101));
    }

    #[test]
    fn handler_var_writes_survive_until_the_next_hook() {
        let mut world = World::new();
        let entity = world.spawn(ScriptVars::default()).id();
        let services = RuntimeServices::headless(None);
        let source = r#"
            fn register_events(ctx) { ctx.subscribe("door.knock", "on_knock"); }
            fn on_knock(ctx, payload) { ctx.set_var("open", true); }
            fn tick(ctx, dt) { ctx.set_var("seen", ctx.has_var("open")); }
        "#;
        let mut behaviour = ScriptBehaviour::new("door", program(source)).expect("instantiate");
        let mut ctx = ScriptContext::for_entity(&mut world, entity, "door", Frame::default(), &services);
        behaviour.register_event_handlers(&mut ctx).expect("register");

        services.bus.publish(&mut CustomEvent::new("door.knock"));
        let mut ctx = ScriptContext::for_entity(&mut world, entity, "door", Frame { tick: 1, dt: 0.1 }, &services);
        behaviour.tick(&mut ctx).expect("tick");

        let vars = world.get::<ScriptVars>(entity).expect("vars");
        assert_eq!(vars.0.get("seen").and_then(|value| value.as_bool().ok()), Some(true));
        assert_eq!(vars.0.get("open").and_then(|value| value.as_bool().ok()), Some(true));
    }

    #[test]
    fn despawned_entity_keeps_vars_unmirrored() {
        let mut world = World::new();
        let entity = world.spawn_empty().id();
        world.despawn(entity);
        let services = RuntimeServices::headless(None);
        let mut behaviour =
            ScriptBehaviour::new("ghost", program("fn tick(ctx, dt) { ctx.set_var(\"seen\", true); }")).expect("instantiate");

        let mut ctx = ScriptContext::for_entity(&mut world, entity, "ghost", Frame { tick: 1, dt: 0.1 }, &services);
        behaviour.tick(&mut ctx).expect("tick still succeeds");
        assert!(behaviour.shared.vars_dirty.load(Ordering::Acquire));
        assert!(lock(&behaviour.shared.vars).contains_key("seen"));
        assert!(world.get::<ScriptVars>(entity).is_none());
    }

    #[test]
    fn subscriptions_are_disposed_on_drop() {
        let mut world = World::new();
        let entity = world.spawn_empty().id();
        let services = RuntimeServices::new(EventBus::new(), crate::api::ScriptApis::headless(), None);
        let source = r#"
            fn register_events(ctx) { ctx.subscribe("door.knock", "on_knock"); }
            fn on_knock(ctx, payload) { "busy" }
        "#;
        let mut behaviour = ScriptBehaviour::new("door", program(source)).expect("instantiate");
        let mut ctx = ScriptContext::for_entity(&mut world, entity, "door", Frame::default(), &services);
        behaviour.register_event_handlers(&mut ctx).expect("register");
        assert_eq!(services.bus.subscriber_count::<CustomEvent>(), 1);

        let mut knock = CustomEvent::new("door.knock");
        assert_eq!(services.bus.publish_cancellable(&mut knock).reason(), Some("busy"));

        drop(behaviour);
        assert_eq!(services.bus.subscriber_count::<CustomEvent>(), 0);
    }
}
