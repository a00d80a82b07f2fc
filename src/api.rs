//! Domain services behaviours reach through their [`ScriptContext`](crate::context::ScriptContext).
//!
//! The services themselves (player state, NPC movement, map data, dialogue UI) live
//! outside this crate. The traits below are the seam; [`ScriptApis::headless`]
//! wires in-memory stand-ins used by the harness and tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use bevy_ecs::prelude::Entity;
use glam::IVec2;

use crate::ecs::Direction;

pub trait PlayerApi: Send + Sync {
    fn player_entity(&self) -> Option<Entity>;
    fn player_tile(&self) -> Option<IVec2>;
}

pub trait NpcApi: Send + Sync {
    /// Queues a one-tile step. Returns `false` when the move was refused.
    fn request_move(&self, npc: Entity, direction: Direction) -> bool;
    fn face(&self, npc: Entity, direction: Direction);
}

pub trait MapApi: Send + Sync {
    fn current_map(&self) -> Option<String>;
    fn is_passable(&self, tile: IVec2) -> bool;
}

pub trait DialogueApi: Send + Sync {
    fn show_message(&self, speaker: Option<Entity>, text: &str);
    fn is_open(&self) -> bool;
}

/// Bundle of domain services handed to every behaviour call.
#[derive(Clone)]
pub struct ScriptApis {
    pub player: Arc<dyn PlayerApi>,
    pub npc: Arc<dyn NpcApi>,
    pub map: Arc<dyn MapApi>,
    pub dialogue: Arc<dyn DialogueApi>,
}

impl ScriptApis {
    pub fn headless() -> Self {
        Self {
            player: Arc::new(HeadlessPlayer::default()),
            npc: Arc::new(HeadlessNpcs::default()),
            map: Arc::new(HeadlessMap::default()),
            dialogue: Arc::new(HeadlessDialogue::default()),
        }
    }
}

impl Default for ScriptApis {
    fn default() -> Self {
        Self::headless()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct HeadlessPlayer {
    state: Mutex<Option<(Entity, IVec2)>>,
}

impl HeadlessPlayer {
    pub fn set(&self, entity: Entity, tile: IVec2) {
        *lock(&self.state) = Some((entity, tile));
    }
}

impl PlayerApi for HeadlessPlayer {
    fn player_entity(&self) -> Option<Entity> {
        lock(&self.state).map(|(entity, _)| entity)
    }

    fn player_tile(&self) -> Option<IVec2> {
        lock(&self.state).map(|(_, tile)| tile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpcRequest {
    Move { npc: Entity, direction: Direction },
    Face { npc: Entity, direction: Direction },
}

/// Records NPC requests; moves are refused while `frozen` is set.
#[derive(Debug, Default)]
pub struct HeadlessNpcs {
    requests: Mutex<Vec<NpcRequest>>,
    frozen: Mutex<HashSet<Entity>>,
}

impl HeadlessNpcs {
    pub fn freeze(&self, npc: Entity) {
        lock(&self.frozen).insert(npc);
    }

    pub fn requests(&self) -> Vec<NpcRequest> {
        lock(&self.requests).clone()
    }

    pub fn take_requests(&self) -> Vec<NpcRequest> {
        std::mem::take(&mut *lock(&self.requests))
    }
}

impl NpcApi for HeadlessNpcs {
    fn request_move(&self, npc: Entity, direction: Direction) -> bool {
        if lock(&self.frozen).contains(&npc) {
            return false;
        }
        lock(&self.requests).push(NpcRequest::Move { npc, direction });
        true
    }

    fn face(&self, npc: Entity, direction: Direction) {
        lock(&self.requests).push(NpcRequest::Face { npc, direction });
    }
}

/// Every tile is passable unless listed in `blocked`.
#[derive(Debug, Default)]
pub struct HeadlessMap {
    name: Mutex<Option<String>>,
    blocked: Mutex<HashSet<IVec2>>,
}

impl HeadlessMap {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Mutex::new(Some(name.into())), blocked: Mutex::default() }
    }

    pub fn block(&self, tile: IVec2) {
        lock(&self.blocked).insert(tile);
    }
}

impl MapApi for HeadlessMap {
    fn current_map(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    fn is_passable(&self, tile: IVec2) -> bool {
        !lock(&self.blocked).contains(&tile)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueLine {
    pub speaker: Option<Entity>,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct HeadlessDialogue {
    lines: Mutex<Vec<DialogueLine>>,
}

impl HeadlessDialogue {
    pub fn lines(&self) -> Vec<DialogueLine> {
        lock(&self.lines).clone()
    }

    pub fn take_lines(&self) -> Vec<DialogueLine> {
        std::mem::take(&mut *lock(&self.lines))
    }
}

impl DialogueApi for HeadlessDialogue {
    fn show_message(&self, speaker: Option<Entity>, text: &str) {
        lock(&self.lines).push(DialogueLine { speaker, text: text.to_string() });
    }

    fn is_open(&self) -> bool {
        !lock(&self.lines).is_empty()
    }
}
