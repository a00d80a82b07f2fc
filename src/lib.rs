pub mod api;
pub mod behaviour;
pub mod cli;
pub mod config;
pub mod context;
pub mod ecs;
pub mod error;
pub mod events;
pub mod harness;
pub mod logging;
pub mod script_watch;
pub mod scripts;
pub mod time;

pub use behaviour::{Behaviour, BehaviourRuntime, LifecycleManager};
pub use context::{RuntimeServices, ScriptContext};
pub use events::EventBus;
pub use scripts::BehaviourRegistry;
