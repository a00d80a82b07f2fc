use bevy_ecs::prelude::*;
use glam::IVec2;
use serde::{Deserialize, Serialize};

// ---------- Components ----------
#[derive(Component, Debug, Clone, PartialEq, Eq)]
pub struct Name(pub String);

#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TilePosition(pub IVec2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Down,
    Up,
    Left,
    Right,
}

impl Direction {
    pub fn offset(self) -> IVec2 {
        match self {
            Direction::Down => IVec2::new(0, 1),
            Direction::Up => IVec2::new(0, -1),
            Direction::Left => IVec2::new(-1, 0),
            Direction::Right => IVec2::new(1, 0),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Down => "down",
            Direction::Up => "up",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "down" | "south" => Some(Direction::Down),
            "up" | "north" => Some(Direction::Up),
            "left" | "west" => Some(Direction::Left),
            "right" | "east" => Some(Direction::Right),
            _ => None,
        }
    }
}

#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Facing(pub Direction);

// ---------- World container ----------
/// Entity/component store the behaviour runtime drives.
///
/// Despawning through [`EcsWorld::despawn_entity`] skips behaviour teardown; entities
/// carrying behaviours go through `BehaviourRuntime::destroy_entity` instead.
pub struct EcsWorld {
    pub world: World,
}

impl Default for EcsWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl EcsWorld {
    pub fn new() -> Self {
        Self { world: World::new() }
    }

    pub fn spawn_named(&mut self, name: impl Into<String>) -> Entity {
        self.world.spawn(Name(name.into())).id()
    }

    pub fn spawn_at(&mut self, name: impl Into<String>, tile: IVec2) -> Entity {
        self.world.spawn((Name(name.into()), TilePosition(tile), Facing::default())).id()
    }

    pub fn entity_exists(&self, entity: Entity) -> bool {
        self.world.get_entity(entity).is_ok()
    }

    pub fn entity_count(&self) -> usize {
        self.world.entities().len() as usize
    }

    pub fn name_of(&self, entity: Entity) -> Option<&str> {
        self.world.get::<Name>(entity).map(|name| name.0.as_str())
    }

    pub fn find_by_name(&mut self, name: &str) -> Option<Entity> {
        let mut query = self.world.query::<(Entity, &Name)>();
        query.iter(&self.world).find(|(_, candidate)| candidate.0 == name).map(|(entity, _)| entity)
    }

    pub fn tile_of(&self, entity: Entity) -> Option<IVec2> {
        self.world.get::<TilePosition>(entity).map(|pos| pos.0)
    }

    pub fn set_tile(&mut self, entity: Entity, tile: IVec2) -> bool {
        if let Some(mut pos) = self.world.get_mut::<TilePosition>(entity) {
            pos.0 = tile;
            true
        } else if let Ok(mut entity_mut) = self.world.get_entity_mut(entity) {
            entity_mut.insert(TilePosition(tile));
            true
        } else {
            false
        }
    }

    pub fn despawn_entity(&mut self, entity: Entity) -> bool {
        self.world.despawn(entity)
    }
}
