//! Typed publish/subscribe between subsystems.
//!
//! Every event type gets its own handler list on the [`EventBus`]. Handlers run
//! synchronously in registration order; a failing handler is logged and skipped
//! over, never propagated to the publisher.
//!
//! Cancellable and blockable events carry a [`Veto`]. Dispatch never stops early
//! when a handler vetoes: every handler still runs and the first veto sticks.
//! Publishers read the outcome from the [`Verdict`] returned by
//! [`EventBus::publish_cancellable`] or [`EventBus::publish_blockable`].

mod bus;
mod gameplay;

use std::any::Any;
use std::fmt;
use std::time::Instant;

pub use bus::{BusStats, DispatchReport, EventBus, Subscription};
pub use gameplay::{
    BehaviourActivated, BehaviourDeactivated, CustomEvent, EntityDestroying, MovementRequested, TileEntered,
};

/// A message that can travel over the [`EventBus`].
pub trait Event: Any + Send + 'static {
    /// Identifier used in logs and by script-facing filters.
    fn event_type(&self) -> &str;

    /// When the event was created.
    fn timestamp(&self) -> Instant;
}

/// Sticky veto slot: the first writer decides, later writers are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Veto {
    reason: Option<String>,
}

impl Veto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a veto. Returns `false` when an earlier handler already vetoed,
    /// in which case the original reason is kept.
    pub fn veto(&mut self, reason: impl Into<String>) -> bool {
        if self.reason.is_some() {
            return false;
        }
        self.reason = Some(reason.into());
        true
    }

    pub fn is_vetoed(&self) -> bool {
        self.reason.is_some()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn verdict(&self) -> Verdict {
        match &self.reason {
            Some(reason) => Verdict::Vetoed { reason: reason.clone() },
            None => Verdict::Proceed,
        }
    }
}

/// Outcome of dispatching a cancellable or blockable event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Vetoed { reason: String },
}

impl Verdict {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Verdict::Proceed)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Verdict::Proceed => None,
            Verdict::Vetoed { reason } => Some(reason),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Proceed => f.write_str("proceed"),
            Verdict::Vetoed { reason } => write!(f, "vetoed ({reason})"),
        }
    }
}

/// Events a handler may cancel.
pub trait Cancellable: Event {
    fn cancellation(&self) -> &Veto;
    fn cancellation_mut(&mut self) -> &mut Veto;

    fn cancel(&mut self, reason: impl Into<String>) -> bool
    where
        Self: Sized,
    {
        self.cancellation_mut().veto(reason)
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation().is_vetoed()
    }

    fn cancel_reason(&self) -> Option<&str> {
        self.cancellation().reason()
    }
}

/// Events a handler may block (movement onto a tile, an interaction, ...).
pub trait Blockable: Event {
    fn blocking(&self) -> &Veto;
    fn blocking_mut(&mut self) -> &mut Veto;

    fn block(&mut self, reason: impl Into<String>) -> bool
    where
        Self: Sized,
    {
        self.blocking_mut().veto(reason)
    }

    fn is_blocked(&self) -> bool {
        self.blocking().is_vetoed()
    }

    fn block_reason(&self) -> Option<&str> {
        self.blocking().reason()
    }
}
