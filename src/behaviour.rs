//! Per-entity behaviours and the machinery that drives them each tick.
//!
//! A [`Behaviour`] is created per (entity, family) from a shared
//! [`BehaviourTemplate`](crate::scripts::BehaviourTemplate) and walks through
//! `initialize` → `register_event_handlers` → `tick`* → `unload`. The
//! [`LifecycleManager`] of each family owns the instances; entities only carry an
//! [`Attachment`] naming the behaviour.

mod attachment;
mod lifecycle;
mod runtime;
pub mod script;

use anyhow::Result;

use crate::context::ScriptContext;

pub use attachment::{AttachedScript, Attachment, BehaviourFamily, NpcBehaviour, TileBehaviour};
pub use lifecycle::{FamilyTickReport, LifecycleManager, LifecycleState, LifecycleStats};
pub use runtime::{BehaviourRuntime, TickSummary};
pub use script::{ScriptBehaviour, ScriptVars};

/// Deactivation reason when the behaviour id cannot be resolved or compiled.
pub const REASON_NOT_FOUND: &str = "script not found";
/// Deactivation reason when the template exists but building an instance failed.
pub const REASON_INSTANCE_FAILED: &str = "instance creation failed";
pub const REASON_DETACHED: &str = "detached";
pub const REASON_DEACTIVATED: &str = "deactivated";
pub const REASON_ENTITY_DESTROYED: &str = "entity destroyed";
pub const REASON_ATTACHMENT_REMOVED: &str = "attachment removed";
pub const REASON_REPLACED: &str = "behaviour replaced";
pub const REASON_SHUTDOWN: &str = "runtime shutdown";

/// Logic bound to one entity. Every hook but `tick` is optional.
///
/// Subscriptions a behaviour keeps in its own fields are disposed when the
/// instance is dropped, which the lifecycle manager does right after `unload`.
pub trait Behaviour: Send {
    fn initialize(&mut self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
        Ok(())
    }

    fn register_event_handlers(&mut self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
        Ok(())
    }

    fn tick(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()>;

    fn unload(&mut self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
        Ok(())
    }
}
