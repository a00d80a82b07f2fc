use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use kestrel_behaviours::behaviour::{
    AttachedScript, Attachment, Behaviour, BehaviourRuntime, LifecycleState, NpcBehaviour, TileBehaviour,
    REASON_ATTACHMENT_REMOVED, REASON_DEACTIVATED, REASON_DETACHED, REASON_ENTITY_DESTROYED, REASON_INSTANCE_FAILED,
    REASON_NOT_FOUND, REASON_REPLACED,
};
use kestrel_behaviours::config::{RuntimeConfig, ScriptConfig};
use kestrel_behaviours::context::ScriptContext;
use kestrel_behaviours::ecs::{EcsWorld, Name};
use kestrel_behaviours::error::{BehaviourError, LifecycleHook};
use kestrel_behaviours::events::{BehaviourDeactivated, CustomEvent, EntityDestroying, Event, Subscription};

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|candidate| candidate.as_str() == entry).count()
    }

    fn ticks_at(&self, tick: u64) -> Vec<String> {
        let suffix = format!(":tick:{tick}");
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|entry| entry.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Healthy,
    FailInit,
    FailTickAt(u64),
    PanicTick,
    DespawnAt(u64),
    FailUnload,
}

struct Recorder {
    mode: Mode,
    journal: Journal,
    label: String,
    subscriptions: Vec<Subscription>,
}

impl Behaviour for Recorder {
    fn initialize(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        self.label = ctx.try_get_state::<Name>().map(|name| name.0.clone()).unwrap_or_else(|| "?".into());
        self.journal.push(format!("{}:init", self.label));
        if self.mode == Mode::FailInit {
            bail!("nope");
        }
        Ok(())
    }

    fn register_event_handlers(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        self.journal.push(format!("{}:register", self.label));
        let journal = self.journal.clone();
        let label = self.label.clone();
        self.subscriptions.push(ctx.subscribe::<CustomEvent, _>(move |event| {
            journal.push(format!("{label}:heard:{}", event.event_type()));
            Ok(())
        }));
        Ok(())
    }

    fn tick(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        let tick = ctx.frame().tick;
        self.journal.push(format!("{}:tick:{tick}", self.label));
        match self.mode {
            Mode::FailTickAt(at) if at == tick => bail!("boom"),
            Mode::PanicTick => panic!("kaboom"),
            Mode::DespawnAt(at) if at == tick => ctx.request_despawn()?,
            _ => {}
        }
        Ok(())
    }

    fn unload(&mut self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
        self.journal.push(format!("{}:unload", self.label));
        if self.mode == Mode::FailUnload {
            bail!("stuck");
        }
        Ok(())
    }
}

fn setup() -> (BehaviourRuntime, EcsWorld, Journal) {
    let config = RuntimeConfig {
        scripts: ScriptConfig { root: "no-scripts-here".into(), ..ScriptConfig::default() },
        ..RuntimeConfig::default()
    };
    (BehaviourRuntime::headless(&config), EcsWorld::new(), Journal::default())
}

fn register(runtime: &BehaviourRuntime, id: &str, mode: Mode, journal: &Journal) {
    let journal = journal.clone();
    runtime.registry().register_native(id, move || -> Result<Box<dyn Behaviour>> {
        Ok(Box::new(Recorder { mode, journal: journal.clone(), label: String::new(), subscriptions: Vec::new() }))
    });
}

fn record_deactivations(runtime: &BehaviourRuntime, journal: &Journal) -> Subscription {
    let journal = journal.clone();
    runtime.bus().subscribe::<BehaviourDeactivated, _>(move |event| {
        journal.push(format!("deactivated:{}:{}", event.behaviour, event.reason));
        Ok(())
    })
}

fn npc(ecs: &EcsWorld, entity: bevy_ecs::entity::Entity) -> Attachment {
    ecs.world.get::<NpcBehaviour>(entity).expect("npc attachment").0.clone()
}

#[test]
fn failing_behaviour_does_not_affect_neighbours() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "flaky", Mode::FailTickAt(1), &journal);
    register(&runtime, "steady", Mode::Healthy, &journal);
    let x = ecs.spawn_named("x");
    let y = ecs.spawn_named("y");
    runtime.attach::<NpcBehaviour>(&mut ecs, x, Attachment::new("flaky"));
    runtime.attach::<NpcBehaviour>(&mut ecs, y, Attachment::new("steady"));

    let summary = runtime.tick(&mut ecs, 0.1);
    assert_eq!(summary.npcs.errored, 1);
    assert_eq!(summary.npcs.executed, 1);
    for _ in 0..3 {
        runtime.tick(&mut ecs, 0.1);
    }

    assert_eq!(journal.count("y:tick:4"), 1);
    assert_eq!(journal.count("x:tick:2"), 0);
    assert_eq!(journal.count("x:unload"), 1);
    let x_state = npc(&ecs, x);
    assert!(!x_state.active);
    assert_eq!(x_state.deactivation_reason.as_deref(), Some("runtime error in tick: boom"));
    assert_eq!(
        runtime.npcs().last_error(x),
        Some(&BehaviourError::Runtime { id: "flaky".into(), hook: LifecycleHook::Tick, message: "boom".into() })
    );
    assert!(npc(&ecs, y).active);
    assert!(runtime.npcs().last_error(y).is_none());
}

#[test]
fn panics_are_contained() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "panicky", Mode::PanicTick, &journal);
    let entity = ecs.spawn_named("p");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("panicky"));

    let summary = runtime.tick(&mut ecs, 0.1);
    assert_eq!(summary.npcs.errored, 1);
    let reason = npc(&ecs, entity).deactivation_reason.expect("reason");
    assert!(reason.starts_with("runtime error in tick: panicked"), "{reason}");
    assert_eq!(journal.count("p:unload"), 1);
    assert!(!runtime.npcs().has_instance(entity));
}

#[test]
fn initialize_runs_once_and_sets_flags() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    let entity = ecs.spawn_named("a");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("sentry"));
    assert_eq!(runtime.npcs().state(&ecs.world, entity), LifecycleState::Unattached);

    let summary = runtime.tick(&mut ecs, 0.1);
    assert_eq!(summary.npcs.activated, 1);
    runtime.tick(&mut ecs, 0.1);
    runtime.tick(&mut ecs, 0.1);

    assert_eq!(journal.count("a:init"), 1);
    assert_eq!(journal.count("a:register"), 1);
    assert_eq!(journal.ticks_at(3), vec!["a".to_string()]);
    let attachment = npc(&ecs, entity);
    assert!(attachment.initialized);
    assert_eq!(attachment.instance_id, runtime.npcs().instance_id(entity));
    assert_eq!(runtime.npcs().state(&ecs.world, entity), LifecycleState::Active);
}

#[test]
fn failed_initialize_skips_unload() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "picky", Mode::FailInit, &journal);
    let entity = ecs.spawn_named("i");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("picky"));

    runtime.tick(&mut ecs, 0.1);
    runtime.tick(&mut ecs, 0.1);
    assert_eq!(journal.count("i:init"), 1);
    assert_eq!(journal.count("i:register"), 0);
    assert_eq!(journal.count("i:unload"), 0);
    assert_eq!(npc(&ecs, entity).deactivation_reason.as_deref(), Some("runtime error in initialize: nope"));
}

#[test]
fn unload_failure_still_tears_down() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "stuck", Mode::FailUnload, &journal);
    let entity = ecs.spawn_named("s");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("stuck"));
    runtime.tick(&mut ecs, 0.1);

    let frame = runtime.frame();
    assert!(runtime.npcs_mut().detach(&mut ecs.world, entity, frame));
    assert_eq!(journal.count("s:unload"), 1);
    assert!(!runtime.npcs().has_instance(entity));
    assert!(ecs.world.get::<NpcBehaviour>(entity).is_none());
    assert!(runtime.npcs().last_error(entity).is_none(), "detached attachments forget their failures");
}

#[test]
fn unload_failure_is_recorded_against_its_hook() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "stuck", Mode::FailUnload, &journal);
    let entity = ecs.spawn_named("u");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("stuck"));
    runtime.tick(&mut ecs, 0.1);

    let frame = runtime.frame();
    assert!(runtime.npcs_mut().set_active(&mut ecs.world, entity, false, frame));
    let err = runtime.npcs().last_error(entity).expect("unload failure recorded");
    assert_eq!(err.hook(), Some(LifecycleHook::Unload));
    assert_eq!(err.id(), "stuck");
    assert_eq!(npc(&ecs, entity).deactivation_reason.as_deref(), Some(REASON_DEACTIVATED));

    let frame = runtime.frame();
    runtime.npcs_mut().set_active(&mut ecs.world, entity, true, frame);
    runtime.tick(&mut ecs, 0.1);
    assert!(runtime.npcs().last_error(entity).is_none(), "a fresh instance clears the record");
}

struct Renamer {
    journal: Journal,
}

impl Behaviour for Renamer {
    fn initialize(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        ctx.set_state(Name("renamed".into()))?;
        Ok(())
    }

    fn tick(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()> {
        let name = ctx.get_state::<Name>()?.0.clone();
        self.journal.push(format!("{name}:tick:{}", ctx.frame().tick));
        Ok(())
    }
}

#[test]
fn first_tick_sees_state_written_during_initialize() {
    let (mut runtime, mut ecs, journal) = setup();
    let sink = journal.clone();
    runtime
        .registry()
        .register_native("renamer", move || -> Result<Box<dyn Behaviour>> { Ok(Box::new(Renamer { journal: sink.clone() })) });
    let entity = ecs.spawn_named("before");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("renamer"));

    let summary = runtime.tick(&mut ecs, 0.1);
    assert_eq!(summary.npcs.executed, 1);
    assert_eq!(journal.ticks_at(1), vec!["renamed".to_string()]);
}

#[test]
fn detach_unloads_once_and_removes_component() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    let _deactivations = record_deactivations(&runtime, &journal);
    let entity = ecs.spawn_named("d");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("sentry"));
    runtime.tick(&mut ecs, 0.1);
    assert_eq!(runtime.bus().subscriber_count::<CustomEvent>(), 1);

    let frame = runtime.frame();
    assert!(runtime.npcs_mut().detach(&mut ecs.world, entity, frame));
    assert!(!runtime.npcs_mut().detach(&mut ecs.world, entity, frame));
    runtime.tick(&mut ecs, 0.1);

    assert_eq!(journal.count("d:unload"), 1);
    assert_eq!(journal.count(&format!("deactivated:sentry:{REASON_DETACHED}")), 1);
    assert_eq!(runtime.bus().subscriber_count::<CustomEvent>(), 0);
    assert!(ecs.world.get::<NpcBehaviour>(entity).is_none());
    assert!(ecs.entity_exists(entity));
}

#[test]
fn event_handlers_stop_after_unload() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    let entity = ecs.spawn_named("h");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("sentry"));
    runtime.tick(&mut ecs, 0.1);

    runtime.bus().publish(&mut CustomEvent::new("bell"));
    let frame = runtime.frame();
    runtime.npcs_mut().set_active(&mut ecs.world, entity, false, frame);
    runtime.bus().publish(&mut CustomEvent::new("bell"));
    assert_eq!(journal.count("h:heard:bell"), 1);
}

#[test]
fn destroy_entity_unloads_before_announcing() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    let _deactivations = record_deactivations(&runtime, &journal);
    let _destroying = {
        let journal = journal.clone();
        runtime.bus().subscribe::<EntityDestroying, _>(move |_| {
            journal.push("destroying".to_string());
            Ok(())
        })
    };
    let entity = ecs.spawn_named("e");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("sentry"));
    runtime.attach::<TileBehaviour>(&mut ecs, entity, Attachment::new("sentry"));
    runtime.tick(&mut ecs, 0.1);
    assert_eq!(runtime.live_instances(), 2);

    assert!(runtime.destroy_entity(&mut ecs, entity));
    assert!(!runtime.destroy_entity(&mut ecs, entity));
    runtime.tick(&mut ecs, 0.1);

    let entries = journal.entries();
    let last_unload = entries.iter().rposition(|entry| entry == "e:unload").expect("unload");
    let destroying = entries.iter().position(|entry| entry == "destroying").expect("destroying");
    assert!(last_unload < destroying);
    assert_eq!(journal.count("e:unload"), 2);
    assert_eq!(journal.count(&format!("deactivated:sentry:{REASON_ENTITY_DESTROYED}")), 2);
    assert_eq!(journal.count("destroying"), 1);
    assert!(!ecs.entity_exists(entity));
    assert_eq!(runtime.live_instances(), 0);
}

#[test]
fn despawned_entities_are_swept_once() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    let _deactivations = record_deactivations(&runtime, &journal);
    let gone = ecs.spawn_named("gone");
    let bare = ecs.spawn_named("bare");
    runtime.attach::<NpcBehaviour>(&mut ecs, gone, Attachment::new("sentry"));
    runtime.attach::<NpcBehaviour>(&mut ecs, bare, Attachment::new("sentry"));
    runtime.tick(&mut ecs, 0.1);

    assert!(ecs.despawn_entity(gone));
    ecs.world.entity_mut(bare).remove::<NpcBehaviour>();
    let summary = runtime.tick(&mut ecs, 0.1);
    runtime.tick(&mut ecs, 0.1);

    assert_eq!(summary.npcs.deactivated, 2);
    assert_eq!(journal.count("gone:unload"), 1);
    assert_eq!(journal.count("bare:unload"), 1);
    assert_eq!(journal.count(&format!("deactivated:sentry:{REASON_ENTITY_DESTROYED}")), 1);
    assert_eq!(journal.count(&format!("deactivated:sentry:{REASON_ATTACHMENT_REMOVED}")), 1);
    assert_eq!(runtime.npcs().live_instances(), 0);
}

#[test]
fn requested_despawn_goes_through_the_destruction_hook() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "doomed", Mode::DespawnAt(2), &journal);
    let entity = ecs.spawn_named("z");
    runtime.attach::<AttachedScript>(&mut ecs, entity, Attachment::new("doomed"));

    assert_eq!(runtime.tick(&mut ecs, 0.1).despawned, 0);
    let summary = runtime.tick(&mut ecs, 0.1);
    assert_eq!(summary.despawned, 1);
    assert_eq!(summary.scripts.executed, 1);
    assert!(!ecs.entity_exists(entity));
    assert_eq!(journal.count("z:unload"), 1);
}

#[test]
fn deactivated_attachment_is_skipped_until_reactivated() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    let entity = ecs.spawn_named("r");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("sentry"));
    runtime.tick(&mut ecs, 0.1);
    let first_instance = runtime.npcs().instance_id(entity).expect("instance");

    let frame = runtime.frame();
    assert!(runtime.npcs_mut().set_active(&mut ecs.world, entity, false, frame));
    assert_eq!(journal.count("r:unload"), 1);
    assert_eq!(npc(&ecs, entity).deactivation_reason.as_deref(), Some(REASON_DEACTIVATED));
    assert_eq!(runtime.npcs().state(&ecs.world, entity), LifecycleState::Deactivated);
    runtime.tick(&mut ecs, 0.1);
    assert!(journal.ticks_at(2).is_empty());

    let frame = runtime.frame();
    assert!(runtime.npcs_mut().set_active(&mut ecs.world, entity, true, frame));
    runtime.tick(&mut ecs, 0.1);
    assert_eq!(journal.count("r:init"), 2);
    assert_eq!(journal.ticks_at(3), vec!["r".to_string()]);
    let second_instance = runtime.npcs().instance_id(entity).expect("instance");
    assert_ne!(first_instance, second_instance);
}

#[test]
fn inactive_attachments_never_start() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    let entity = ecs.spawn_named("n");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("sentry").inactive());
    runtime.tick(&mut ecs, 0.1);
    assert!(journal.entries().is_empty());
    assert!(!runtime.npcs().has_instance(entity));
}

#[test]
fn priority_orders_ticks() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    for (name, priority) in [("low", 1), ("high_a", 5), ("high_b", 5), ("top", 9)] {
        let entity = ecs.spawn_named(name);
        runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("sentry").with_priority(priority));
    }
    runtime.tick(&mut ecs, 0.1);
    runtime.tick(&mut ecs, 0.1);
    let expected: Vec<String> = ["top", "high_a", "high_b", "low"].into_iter().map(String::from).collect();
    assert_eq!(journal.ticks_at(1), expected);
    assert_eq!(journal.ticks_at(2), expected);
}

#[test]
fn families_tick_tiles_then_npcs_then_scripts() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    let script = ecs.spawn_named("script");
    let npc_entity = ecs.spawn_named("npc");
    let tile = ecs.spawn_named("tile");
    runtime.attach::<AttachedScript>(&mut ecs, script, Attachment::new("sentry").with_priority(100));
    runtime.attach::<NpcBehaviour>(&mut ecs, npc_entity, Attachment::new("sentry"));
    runtime.attach::<TileBehaviour>(&mut ecs, tile, Attachment::new("sentry"));

    let summary = runtime.tick(&mut ecs, 0.1);
    assert_eq!(summary.total().executed, 3);
    assert_eq!(journal.ticks_at(1), vec!["tile".to_string(), "npc".to_string(), "script".to_string()]);
}

#[test]
fn unknown_behaviour_deactivates_with_not_found() {
    let (mut runtime, mut ecs, journal) = setup();
    let _deactivations = record_deactivations(&runtime, &journal);
    let entity = ecs.spawn_named("ghost");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("ghost"));

    let summary = runtime.tick(&mut ecs, 0.1);
    assert_eq!(summary.npcs.deactivated, 1);
    assert_eq!(summary.npcs.executed, 0);
    assert_eq!(runtime.tick(&mut ecs, 0.1).npcs.deactivated, 0);
    assert_eq!(npc(&ecs, entity).deactivation_reason.as_deref(), Some(REASON_NOT_FOUND));
    assert_eq!(journal.count(&format!("deactivated:ghost:{REASON_NOT_FOUND}")), 1);
}

#[test]
fn factory_failure_deactivates_with_instance_failed() {
    let (mut runtime, mut ecs, _journal) = setup();
    runtime
        .registry()
        .register_native("broken", || -> Result<Box<dyn Behaviour>> { Err(anyhow!("no free slots")) });
    let entity = ecs.spawn_named("b");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("broken"));

    runtime.tick(&mut ecs, 0.1);
    let attachment = npc(&ecs, entity);
    assert!(!attachment.active);
    assert_eq!(attachment.deactivation_reason.as_deref(), Some(REASON_INSTANCE_FAILED));
    assert!(matches!(runtime.npcs().last_error(entity), Some(BehaviourError::Instantiation { .. })));
}

#[test]
fn factory_panic_is_tagged_as_instantiation() {
    let (mut runtime, mut ecs, _journal) = setup();
    runtime.registry().register_native("shaky", || -> Result<Box<dyn Behaviour>> { panic!("mould cracked") });
    let entity = ecs.spawn_named("p");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("shaky"));

    let summary = runtime.tick(&mut ecs, 0.1);
    assert_eq!(summary.npcs.deactivated, 1);
    assert_eq!(npc(&ecs, entity).deactivation_reason.as_deref(), Some(REASON_INSTANCE_FAILED));
    let err = runtime.npcs().last_error(entity).expect("recorded");
    assert_eq!(err.hook(), Some(LifecycleHook::Instantiate));
    assert!(err.to_string().contains("panicked: mould cracked"), "{err}");
}

#[test]
fn reload_only_affects_new_activations() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    let old = ecs.spawn_named("old");
    runtime.attach::<NpcBehaviour>(&mut ecs, old, Attachment::new("sentry"));
    runtime.tick(&mut ecs, 0.1);
    let old_instance = runtime.npcs().instance_id(old);

    let reloaded = runtime.registry().reload("sentry").expect("reload");
    assert_eq!(reloaded.version(), 2);

    let new = ecs.spawn_named("new");
    runtime.attach::<NpcBehaviour>(&mut ecs, new, Attachment::new("sentry"));
    runtime.tick(&mut ecs, 0.1);

    assert_eq!(runtime.npcs().instance_template(old).expect("old").version(), 1);
    assert_eq!(runtime.npcs().instance_template(new).expect("new").version(), 2);
    assert_eq!(runtime.npcs().instance_id(old), old_instance);
    assert_eq!(journal.count("old:init"), 1);
}

#[test]
fn changing_the_behaviour_id_replaces_the_instance() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "first", Mode::Healthy, &journal);
    register(&runtime, "second", Mode::Healthy, &journal);
    let _deactivations = record_deactivations(&runtime, &journal);
    let entity = ecs.spawn_named("c");
    runtime.attach::<NpcBehaviour>(&mut ecs, entity, Attachment::new("first"));
    runtime.tick(&mut ecs, 0.1);

    ecs.world.get_mut::<NpcBehaviour>(entity).expect("attachment").0.behaviour = "second".to_string();
    runtime.tick(&mut ecs, 0.1);

    assert_eq!(journal.count(&format!("deactivated:first:{REASON_REPLACED}")), 1);
    assert_eq!(journal.count("c:init"), 2);
    assert_eq!(runtime.npcs().instance_template(entity).expect("template").id(), "second");
    assert!(npc(&ecs, entity).active);
}

#[test]
fn shutdown_unloads_everything() {
    let (mut runtime, mut ecs, journal) = setup();
    register(&runtime, "sentry", Mode::Healthy, &journal);
    for name in ["s1", "s2"] {
        let entity = ecs.spawn_named(name);
        runtime.attach::<AttachedScript>(&mut ecs, entity, Attachment::new("sentry"));
    }
    runtime.tick(&mut ecs, 0.1);
    assert_eq!(runtime.shutdown(&mut ecs), 2);
    assert_eq!(journal.count("s1:unload") + journal.count("s2:unload"), 2);
    assert_eq!(runtime.live_instances(), 0);
    assert_eq!(runtime.bus().subscriber_count::<CustomEvent>(), 0);
}
