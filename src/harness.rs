//! Headless fixture runner: spawns the entities a JSON fixture describes, ticks the
//! behaviour runtime and records what happened so runs can be diffed against goldens.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use bevy_ecs::prelude::*;
use glam::IVec2;
use serde::{Deserialize, Serialize};

use crate::api::{HeadlessDialogue, HeadlessMap, HeadlessNpcs, HeadlessPlayer, NpcRequest, ScriptApis};
use crate::behaviour::{
    AttachedScript, Attachment, BehaviourFamily, BehaviourRuntime, NpcBehaviour, ScriptVars, TileBehaviour,
};
use crate::config::RuntimeConfig;
use crate::ecs::{Direction, EcsWorld, Facing, Name, TilePosition};
use crate::events::{
    BehaviourActivated, BehaviourDeactivated, CustomEvent, EntityDestroying, Event, EventBus, MovementRequested,
    Subscription, TileEntered,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    #[serde(default = "default_script_root")]
    pub script_root: PathBuf,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_dt")]
    pub dt: f32,
    #[serde(default = "default_seed")]
    pub deterministic_seed: Option<u64>,
    #[serde(default)]
    pub map: Option<FixtureMap>,
    /// Name of the entity the player service reports.
    #[serde(default)]
    pub player: Option<String>,
    pub entities: Vec<FixtureEntity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureMap {
    pub name: String,
    #[serde(default)]
    pub blocked: Vec<[i32; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureEntity {
    pub name: String,
    #[serde(default)]
    pub tile: Option<[i32; 2]>,
    #[serde(default)]
    pub tile_behaviour: Option<FixtureAttachment>,
    #[serde(default)]
    pub npc: Option<FixtureAttachment>,
    #[serde(default)]
    pub script: Option<FixtureAttachment>,
    #[serde(default)]
    pub vars: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureAttachment {
    pub behaviour: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl FixtureAttachment {
    fn to_attachment(&self) -> Attachment {
        let attachment = Attachment::new(self.behaviour.clone()).with_priority(self.priority);
        if self.active {
            attachment
        } else {
            attachment.inactive()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub steps: usize,
    pub dt: f32,
    pub behaviours: Vec<String>,
    pub results: Vec<StepResult>,
    pub final_entities: Vec<EntitySummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepCounts {
    pub executed: usize,
    pub errored: usize,
    pub activated: usize,
    pub deactivated: usize,
    pub despawned: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step: usize,
    pub counts: StepCounts,
    pub logs: Vec<String>,
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dialogue: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub moves: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile: Option<[i32; 2]>,
    pub attachments: Vec<AttachmentSummary>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub vars: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentSummary {
    pub family: String,
    pub behaviour: String,
    pub active: bool,
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct HeadlessServices {
    player: Arc<HeadlessPlayer>,
    npcs: Arc<HeadlessNpcs>,
    dialogue: Arc<HeadlessDialogue>,
}

pub fn run_fixture(fixture: &HarnessFixture) -> Result<HarnessOutput> {
    run_fixture_with_config(fixture, &RuntimeConfig::default())
}

/// Runs `fixture` on top of `config`; the fixture's script root and seed win.
pub fn run_fixture_with_config(fixture: &HarnessFixture, config: &RuntimeConfig) -> Result<HarnessOutput> {
    let mut config = config.clone();
    config.scripts.root = fixture.script_root.clone();
    if fixture.deterministic_seed.is_some() {
        config.scripts.seed = fixture.deterministic_seed;
    }

    let map = match &fixture.map {
        Some(layout) => {
            let map = HeadlessMap::named(layout.name.clone());
            for [x, y] in &layout.blocked {
                map.block(IVec2::new(*x, *y));
            }
            map
        }
        None => HeadlessMap::default(),
    };
    let headless = HeadlessServices {
        player: Arc::new(HeadlessPlayer::default()),
        npcs: Arc::new(HeadlessNpcs::default()),
        dialogue: Arc::new(HeadlessDialogue::default()),
    };
    let apis = ScriptApis {
        player: headless.player.clone(),
        npc: headless.npcs.clone(),
        map: Arc::new(map),
        dialogue: headless.dialogue.clone(),
    };
    let mut runtime = BehaviourRuntime::new(&config, apis);
    let mut ecs = EcsWorld::new();

    for entry in &fixture.entities {
        spawn_fixture_entity(&runtime, &mut ecs, entry)?;
    }
    if let Some(player) = &fixture.player {
        let entity = ecs.find_by_name(player).ok_or_else(|| anyhow!("player entity '{player}' not in fixture"))?;
        headless.player.set(entity, ecs.tile_of(entity).unwrap_or_default());
    }

    let recorder = EventRecorder::attach(&runtime);
    let mut results = Vec::with_capacity(fixture.steps);
    for step in 0..fixture.steps {
        let summary = runtime.tick(&mut ecs, fixture.dt);
        let total = summary.total();
        let moves = apply_npc_moves(&runtime, &mut ecs, &headless.npcs);
        let logs = runtime.take_logs().iter().map(ToString::to_string).collect();
        let dialogue = headless
            .dialogue
            .take_lines()
            .into_iter()
            .map(|line| {
                let speaker = line.speaker.and_then(|entity| ecs.name_of(entity)).unwrap_or("narrator");
                format!("{speaker}: {}", line.text)
            })
            .collect();
        results.push(StepResult {
            step,
            counts: StepCounts {
                executed: total.executed,
                errored: total.errored,
                activated: total.activated,
                deactivated: total.deactivated,
                despawned: summary.despawned,
            },
            logs,
            events: recorder.take(),
            dialogue,
            moves,
        });
    }

    let mut final_entities = collect_entities(&mut ecs)?;
    final_entities.sort_by(|a, b| a.name.cmp(&b.name));

    let behaviours: BTreeSet<String> = fixture
        .entities
        .iter()
        .flat_map(|entry| [&entry.tile_behaviour, &entry.npc, &entry.script])
        .flatten()
        .map(|attachment| runtime.registry().normalize_id(&attachment.behaviour))
        .collect();
    Ok(HarnessOutput {
        steps: fixture.steps,
        dt: fixture.dt,
        behaviours: behaviours.into_iter().collect(),
        results,
        final_entities,
    })
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let file = File::open(path.as_ref()).with_context(|| format!("opening fixture '{}'", path.as_ref().display()))?;
    serde_json::from_reader(file).with_context(|| "parsing fixture JSON")
}

fn spawn_fixture_entity(runtime: &BehaviourRuntime, ecs: &mut EcsWorld, entry: &FixtureEntity) -> Result<Entity> {
    let entity = match entry.tile {
        Some([x, y]) => ecs.spawn_at(entry.name.clone(), IVec2::new(x, y)),
        None => ecs.spawn_named(entry.name.clone()),
    };
    if let Some(attachment) = &entry.tile_behaviour {
        runtime.attach::<TileBehaviour>(ecs, entity, attachment.to_attachment());
    }
    if let Some(attachment) = &entry.npc {
        runtime.attach::<NpcBehaviour>(ecs, entity, attachment.to_attachment());
    }
    if let Some(attachment) = &entry.script {
        runtime.attach::<AttachedScript>(ecs, entity, attachment.to_attachment());
    }
    if !entry.vars.is_empty() {
        let value = serde_json::Value::Object(entry.vars.clone());
        let vars = rhai::serde::to_dynamic(&value)
            .map_err(|err| anyhow!("converting vars of '{}': {err}", entry.name))?
            .try_cast::<rhai::Map>()
            .ok_or_else(|| anyhow!("vars of '{}' must be an object", entry.name))?;
        ecs.world.entity_mut(entity).insert(ScriptVars(vars));
    }
    Ok(entity)
}

/// Moves NPCs for the steps their behaviours requested. A blocked `TileEntered`
/// keeps the NPC in place.
fn apply_npc_moves(runtime: &BehaviourRuntime, ecs: &mut EcsWorld, npcs: &HeadlessNpcs) -> Vec<String> {
    let mut moves = Vec::new();
    for request in npcs.take_requests() {
        match request {
            NpcRequest::Move { npc, direction } => {
                let Some(from) = ecs.tile_of(npc) else { continue };
                let to = from + direction.offset();
                let mut entered = TileEntered::new(npc, to);
                let verdict = runtime.bus().publish_blockable(&mut entered);
                let name = ecs.name_of(npc).unwrap_or("?").to_string();
                if let Some(reason) = verdict.reason() {
                    moves.push(format!("{name} blocked at ({},{}): {reason}", to.x, to.y));
                    continue;
                }
                ecs.set_tile(npc, to);
                face(ecs, npc, direction);
                moves.push(format!("{name} -> ({},{})", to.x, to.y));
            }
            NpcRequest::Face { npc, direction } => face(ecs, npc, direction),
        }
    }
    moves
}

fn face(ecs: &mut EcsWorld, npc: Entity, direction: Direction) {
    if let Ok(mut entity_mut) = ecs.world.get_entity_mut(npc) {
        entity_mut.insert(Facing(direction));
    }
}

fn collect_entities(ecs: &mut EcsWorld) -> Result<Vec<EntitySummary>> {
    let mut query = ecs.world.query::<(
        &Name,
        Option<&TilePosition>,
        Option<&TileBehaviour>,
        Option<&NpcBehaviour>,
        Option<&AttachedScript>,
        Option<&ScriptVars>,
    )>();
    let mut out = Vec::new();
    for (name, tile, tile_behaviour, npc, script, vars) in query.iter(&ecs.world) {
        let mut attachments = Vec::new();
        push_summary(&mut attachments, tile_behaviour);
        push_summary(&mut attachments, npc);
        push_summary(&mut attachments, script);
        let vars = match vars {
            Some(vars) => {
                let value: serde_json::Value = rhai::serde::from_dynamic(&rhai::Dynamic::from_map(vars.0.clone()))
                    .map_err(|err| anyhow!("converting vars of '{}': {err}", name.0))?;
                match value {
                    serde_json::Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                }
            }
            None => serde_json::Map::new(),
        };
        out.push(EntitySummary { name: name.0.clone(), tile: tile.map(|pos| [pos.0.x, pos.0.y]), attachments, vars });
    }
    Ok(out)
}

fn push_summary<F: BehaviourFamily>(out: &mut Vec<AttachmentSummary>, component: Option<&F>) {
    if let Some(component) = component {
        let attachment = component.attachment();
        out.push(AttachmentSummary {
            family: F::LABEL.to_string(),
            behaviour: attachment.behaviour.clone(),
            active: attachment.active,
            initialized: attachment.initialized,
            reason: attachment.deactivation_reason.clone(),
        });
    }
}

/// Collects a printable line for every gameplay event published during a step.
struct EventRecorder {
    lines: Arc<Mutex<Vec<String>>>,
    _subscriptions: Vec<Subscription>,
}

impl EventRecorder {
    fn attach(runtime: &BehaviourRuntime) -> Self {
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let bus = runtime.bus();
        let subscriptions = vec![
            record::<BehaviourActivated>(bus, &lines),
            record::<BehaviourDeactivated>(bus, &lines),
            record::<EntityDestroying>(bus, &lines),
            record::<MovementRequested>(bus, &lines),
            record::<CustomEvent>(bus, &lines),
        ];
        Self { lines, _subscriptions: subscriptions }
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

fn record<T>(bus: &EventBus, lines: &Arc<Mutex<Vec<String>>>) -> Subscription
where
    T: Event + std::fmt::Display,
{
    let lines = Arc::clone(lines);
    bus.subscribe::<T, _>(move |event| {
        lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(event.to_string());
        Ok(())
    })
}

fn default_script_root() -> PathBuf {
    PathBuf::from("assets/behaviours")
}

fn default_steps() -> usize {
    3
}

fn default_dt() -> f32 {
    0.016
}

fn default_seed() -> Option<u64> {
    Some(1)
}

fn default_active() -> bool {
    true
}
