use std::fmt;
use std::time::Instant;

use bevy_ecs::prelude::Entity;
use glam::IVec2;

use super::{Blockable, Cancellable, Event, Veto};

/// A behaviour finished `initialize` and `register_event_handlers` for an entity.
#[derive(Debug, Clone)]
pub struct BehaviourActivated {
    pub entity: Entity,
    pub family: &'static str,
    pub behaviour: String,
    pub version: u64,
    pub at: Instant,
}

/// A behaviour was unloaded (or never got going) for an entity.
#[derive(Debug, Clone)]
pub struct BehaviourDeactivated {
    pub entity: Entity,
    pub family: &'static str,
    pub behaviour: String,
    pub reason: String,
    pub at: Instant,
}

/// Published right before an entity is despawned, after its behaviours unloaded.
#[derive(Debug, Clone)]
pub struct EntityDestroying {
    pub entity: Entity,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct MovementRequested {
    pub entity: Entity,
    pub from: IVec2,
    pub to: IVec2,
    pub cancellation: Veto,
    pub at: Instant,
}

impl MovementRequested {
    pub fn new(entity: Entity, from: IVec2, to: IVec2) -> Self {
        Self { entity, from, to, cancellation: Veto::new(), at: Instant::now() }
    }
}

#[derive(Debug, Clone)]
pub struct TileEntered {
    pub entity: Entity,
    pub tile: IVec2,
    pub blocking: Veto,
    pub at: Instant,
}

impl TileEntered {
    pub fn new(entity: Entity, tile: IVec2) -> Self {
        Self { entity, tile, blocking: Veto::new(), at: Instant::now() }
    }
}

/// Script-facing event identified by a string type. Payload values are Rhai values.
#[derive(Debug, Clone)]
pub struct CustomEvent {
    event_type: String,
    pub payload: rhai::Map,
    pub source: Option<Entity>,
    pub cancellation: Veto,
    pub at: Instant,
}

impl CustomEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: rhai::Map::new(),
            source: None,
            cancellation: Veto::new(),
            at: Instant::now(),
        }
    }

    pub fn with_payload(mut self, payload: rhai::Map) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_source(mut self, source: Entity) -> Self {
        self.source = Some(source);
        self
    }
}

impl Event for BehaviourActivated {
    fn event_type(&self) -> &str {
        "behaviour.activated"
    }

    fn timestamp(&self) -> Instant {
        self.at
    }
}

impl Event for BehaviourDeactivated {
    fn event_type(&self) -> &str {
        "behaviour.deactivated"
    }

    fn timestamp(&self) -> Instant {
        self.at
    }
}

impl Event for EntityDestroying {
    fn event_type(&self) -> &str {
        "entity.destroying"
    }

    fn timestamp(&self) -> Instant {
        self.at
    }
}

impl Event for MovementRequested {
    fn event_type(&self) -> &str {
        "movement.requested"
    }

    fn timestamp(&self) -> Instant {
        self.at
    }
}

impl Cancellable for MovementRequested {
    fn cancellation(&self) -> &Veto {
        &self.cancellation
    }

    fn cancellation_mut(&mut self) -> &mut Veto {
        &mut self.cancellation
    }
}

impl Event for TileEntered {
    fn event_type(&self) -> &str {
        "tile.entered"
    }

    fn timestamp(&self) -> Instant {
        self.at
    }
}

impl Blockable for TileEntered {
    fn blocking(&self) -> &Veto {
        &self.blocking
    }

    fn blocking_mut(&mut self) -> &mut Veto {
        &mut self.blocking
    }
}

impl Event for CustomEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn timestamp(&self) -> Instant {
        self.at
    }
}

impl Cancellable for CustomEvent {
    fn cancellation(&self) -> &Veto {
        &self.cancellation
    }

    fn cancellation_mut(&mut self) -> &mut Veto {
        &mut self.cancellation
    }
}

impl fmt::Display for BehaviourActivated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BehaviourActivated entity={} family={} behaviour={} version={}",
            self.entity.index(),
            self.family,
            self.behaviour,
            self.version
        )
    }
}

impl fmt::Display for BehaviourDeactivated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BehaviourDeactivated entity={} family={} behaviour={} reason={}",
            self.entity.index(),
            self.family,
            self.behaviour,
            self.reason
        )
    }
}

impl fmt::Display for EntityDestroying {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityDestroying entity={}", self.entity.index())
    }
}

impl fmt::Display for MovementRequested {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MovementRequested entity={} from=({},{}) to=({},{})",
            self.entity.index(),
            self.from.x,
            self.from.y,
            self.to.x,
            self.to.y
        )?;
        if let Some(reason) = self.cancellation.reason() {
            write!(f, " cancelled={reason}")?;
        }
        Ok(())
    }
}

impl fmt::Display for TileEntered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TileEntered entity={} tile=({},{})", self.entity.index(), self.tile.x, self.tile.y)?;
        if let Some(reason) = self.blocking.reason() {
            write!(f, " blocked={reason}")?;
        }
        Ok(())
    }
}

impl fmt::Display for CustomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomEvent type={}", self.event_type)?;
        if let Some(source) = self.source {
            write!(f, " source={}", source.index())?;
        }
        if !self.payload.is_empty() {
            let keys: Vec<&str> = self.payload.keys().map(|key| key.as_str()).collect();
            write!(f, " payload=[{}]", keys.join(","))?;
        }
        if let Some(reason) = self.cancellation.reason() {
            write!(f, " cancelled={reason}")?;
        }
        Ok(())
    }
}
