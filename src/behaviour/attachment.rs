use bevy_ecs::prelude::*;

/// Links an entity to a behaviour id plus its lifecycle flags.
///
/// `instance_id` only names the live instance held by the lifecycle manager; the
/// attachment never owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub behaviour: String,
    pub priority: i32,
    pub active: bool,
    pub initialized: bool,
    pub instance_id: Option<u64>,
    pub deactivation_reason: Option<String>,
}

impl Attachment {
    pub fn new(behaviour: impl Into<String>) -> Self {
        Self {
            behaviour: behaviour.into(),
            priority: 0,
            active: true,
            initialized: false,
            instance_id: None,
            deactivation_reason: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Marks the attachment for activation on the next tick.
    pub fn reactivate(&mut self) {
        self.active = true;
        self.deactivation_reason = None;
    }

    pub(crate) fn mark_deactivated(&mut self, reason: &str) {
        self.active = false;
        self.initialized = false;
        self.instance_id = None;
        self.deactivation_reason = Some(reason.to_string());
    }
}

/// A component kind that carries an [`Attachment`] and gets its own lifecycle manager.
pub trait BehaviourFamily: Component + Sized {
    const LABEL: &'static str;

    fn from_attachment(attachment: Attachment) -> Self;
    fn attachment(&self) -> &Attachment;
    fn attachment_mut(&mut self) -> &mut Attachment;
}

/// Behaviour of an interactive tile (doors, signs, warps).
#[derive(Component, Debug, Clone, PartialEq, Eq)]
pub struct TileBehaviour(pub Attachment);

/// AI driving a non-player character.
#[derive(Component, Debug, Clone, PartialEq, Eq)]
pub struct NpcBehaviour(pub Attachment);

/// General-purpose script attached to any entity.
#[derive(Component, Debug, Clone, PartialEq, Eq)]
pub struct AttachedScript(pub Attachment);

macro_rules! behaviour_family {
    ($ty:ident, $label:literal) => {
        impl BehaviourFamily for $ty {
            const LABEL: &'static str = $label;

            fn from_attachment(attachment: Attachment) -> Self {
                Self(attachment)
            }

            fn attachment(&self) -> &Attachment {
                &self.0
            }

            fn attachment_mut(&mut self) -> &mut Attachment {
                &mut self.0
            }
        }
    };
}

behaviour_family!(TileBehaviour, "tile");
behaviour_family!(NpcBehaviour, "npc");
behaviour_family!(AttachedScript, "script");
