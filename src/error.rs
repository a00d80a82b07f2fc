use std::any::Any;
use std::fmt;
use std::path::PathBuf;

use bevy_ecs::prelude::Entity;
use thiserror::Error;

use crate::behaviour::{REASON_INSTANCE_FAILED, REASON_NOT_FOUND};

/// Lifecycle hook that was running when a behaviour failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleHook {
    Instantiate,
    Initialize,
    RegisterEventHandlers,
    Tick,
    Unload,
}

impl LifecycleHook {
    pub fn label(self) -> &'static str {
        match self {
            LifecycleHook::Instantiate => "instantiate",
            LifecycleHook::Initialize => "initialize",
            LifecycleHook::RegisterEventHandlers => "register_event_handlers",
            LifecycleHook::Tick => "tick",
            LifecycleHook::Unload => "unload",
        }
    }
}

impl fmt::Display for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Failures produced while resolving, building or running a behaviour.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BehaviourError {
    #[error("behaviour '{id}' failed to compile{}: {message}", format_location(*line, *column))]
    Compilation { id: String, message: String, line: Option<usize>, column: Option<usize> },
    #[error("behaviour '{id}' not found{}", searched.as_ref().map(|p| format!(" (looked in '{}')", p.display())).unwrap_or_default())]
    NotFound { id: String, searched: Option<PathBuf> },
    #[error("behaviour '{id}' could not be read: {message}")]
    Io { id: String, message: String },
    #[error("behaviour '{id}' could not be instantiated: {message}")]
    Instantiation { id: String, message: String },
    #[error("behaviour '{id}' failed during {hook}: {message}")]
    Runtime { id: String, hook: LifecycleHook, message: String },
}

impl BehaviourError {
    pub fn id(&self) -> &str {
        match self {
            BehaviourError::Compilation { id, .. }
            | BehaviourError::NotFound { id, .. }
            | BehaviourError::Io { id, .. }
            | BehaviourError::Instantiation { id, .. }
            | BehaviourError::Runtime { id, .. } => id,
        }
    }

    /// Hook that was running, for runtime failures.
    pub fn hook(&self) -> Option<LifecycleHook> {
        match self {
            BehaviourError::Runtime { hook, .. } => Some(*hook),
            _ => None,
        }
    }

    /// Reason recorded on the attachment when this error takes the behaviour down.
    pub fn deactivation_reason(&self) -> String {
        match self {
            BehaviourError::Compilation { .. } | BehaviourError::NotFound { .. } | BehaviourError::Io { .. } => {
                REASON_NOT_FOUND.to_string()
            }
            BehaviourError::Instantiation { .. } | BehaviourError::Runtime { hook: LifecycleHook::Instantiate, .. } => {
                REASON_INSTANCE_FAILED.to_string()
            }
            BehaviourError::Runtime { hook, message, .. } => format!("runtime error in {hook}: {message}"),
        }
    }

    /// True when the behaviour cannot be resolved to a usable template.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BehaviourError::Compilation { .. } | BehaviourError::NotFound { .. } | BehaviourError::Io { .. }
        )
    }
}

fn format_location(line: Option<usize>, column: Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!(" at line {line}, column {column}"),
        (Some(line), None) => format!(" at line {line}"),
        _ => String::new(),
    }
}

/// Misuse of a [`ScriptContext`](crate::context::ScriptContext) state accessor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("'{operation}' needs an entity-scoped context, but this context is global")]
    GlobalContext { operation: &'static str },
    #[error("entity {entity:?} has no '{component}' component")]
    MissingState { entity: Entity, component: &'static str },
    #[error("entity {entity:?} no longer exists")]
    EntityGone { entity: Entity },
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compilation_error_mentions_location() {
        let err = BehaviourError::Compilation {
            id: "npc/guard".into(),
            message: "Expecting ')'".into(),
            line: Some(3),
            column: Some(14),
        };
        assert_eq!(err.to_string(), "behaviour 'npc/guard' failed to compile at line 3, column 14: Expecting ')'");
        assert!(err.is_unavailable());
    }

    #[test]
    fn runtime_error_is_not_unavailable() {
        let err = BehaviourError::Runtime { id: "door".into(), hook: LifecycleHook::Tick, message: "boom".into() };
        assert_eq!(err.id(), "door");
        assert!(!err.is_unavailable());
        assert!(err.to_string().contains("during tick"));
    }

    #[test]
    fn deactivation_reasons_follow_the_failure() {
        let missing = BehaviourError::NotFound { id: "ghost".into(), searched: None };
        assert_eq!(missing.deactivation_reason(), REASON_NOT_FOUND);
        assert_eq!(missing.hook(), None);

        let panicked = BehaviourError::Runtime {
            id: "door".into(),
            hook: LifecycleHook::Instantiate,
            message: "panicked: no hinges".into(),
        };
        assert_eq!(panicked.deactivation_reason(), REASON_INSTANCE_FAILED);

        let unload = BehaviourError::Runtime { id: "door".into(), hook: LifecycleHook::Unload, message: "stuck".into() };
        assert_eq!(unload.deactivation_reason(), "runtime error in unload: stuck");
        assert_eq!(unload.hook(), Some(LifecycleHook::Unload));
    }

    #[test]
    fn panic_message_handles_str_and_string() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
    }
}
