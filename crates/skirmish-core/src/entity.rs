//! Boundary capabilities the engine consumes
//!
//! The engine does not own a character/skill/item data model. It sees combat
//! participants through three small contracts:
//!
//! - [`CombatEntity`] - readable combat stats plus one attribute mutator;
//!   clamping rules (hp floors/ceilings, etc.) belong to the implementor.
//! - [`Registrable`] - something the [`Handler`](crate::Handler) registry can
//!   classify and track, optionally self-installing a MAIN handler.
//! - [`Listener`] - something that observes broadcasts and may react.

use crate::error::Result;
use crate::handler::{EngineCtx, Handler};
use crate::identity::{EntityId, ListenerId};
use crate::message::GameMessage;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A combat attribute the engine reads or adjusts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    Attack,
    Defense,
    Critical,
    CriticalDamage,
    Evasion,
    Team,
    CurrentHp,
    MaxHp,
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Attribute::Attack => "attack",
            Attribute::Defense => "defense",
            Attribute::Critical => "critical",
            Attribute::CriticalDamage => "critical_damage",
            Attribute::Evasion => "evasion",
            Attribute::Team => "team",
            Attribute::CurrentHp => "current_hp",
            Attribute::MaxHp => "max_hp",
        };
        write!(f, "{}", name)
    }
}

/// Read access to combat stats, plus a single delta-based mutator
///
/// `change_attribute` owns its own clamping semantics; the engine applies
/// deltas and never second-guesses the resulting values.
pub trait CombatEntity {
    fn name(&self) -> &str;
    fn attack(&self) -> i64;
    fn defense(&self) -> i64;
    fn critical(&self) -> i64;
    fn critical_damage(&self) -> i64;
    fn evasion(&self) -> i64;
    fn team(&self) -> i64;
    fn current_hp(&self) -> i64;

    /// Apply a delta to an attribute (positive or negative)
    fn change_attribute(&mut self, attr: Attribute, delta: i64);
}

/// Shared handle to a combat entity
///
/// The engine is strictly single-threaded (one session, one dispatch loop),
/// so `Rc<RefCell<_>>` is the right sharing primitive here.
pub type EntityHandle = Rc<RefCell<dyn CombatEntity>>;

/// Check whether two handles refer to the same entity
pub fn same_entity(a: &EntityHandle, b: &EntityHandle) -> bool {
    Rc::ptr_eq(a, b)
}

/// The closed set of entity kinds the registry classifies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Character,
    Skill,
    Item,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Character => "character",
            EntityKind::Skill => "skill",
            EntityKind::Item => "item",
        };
        write!(f, "{}", name)
    }
}

/// An entity the [`Handler`] registry can track
///
/// The optional `reg_type`/`reg` pair lets an entity install its own MAIN
/// handler the first time it is registered: the registry calls `reg` only if
/// `reg_type` names an event type nobody has claimed yet.
pub trait Registrable {
    fn entity_id(&self) -> EntityId;
    fn kind(&self) -> EntityKind;

    /// Event type this entity wants to install a handler for, if any
    fn reg_type(&self) -> Option<&str> {
        None
    }

    /// Self-installation hook, invoked once per unclaimed `reg_type`
    fn reg(&self, _handler: &mut Handler) -> Result<()> {
        Ok(())
    }
}

/// A broadcast participant
///
/// `update` returns whether the listener meaningfully reacted; true reactions
/// are counted in the chain's reacted ledger and suppress re-delivery during
/// "new"-mode broadcasts. Listeners may mutate the message (typically by
/// appending modifiers) and enqueue follow-up messages through the context.
pub trait Listener {
    fn listener_id(&self) -> ListenerId;

    fn update(&mut self, ctx: &mut EngineCtx<'_>, msg: &mut GameMessage) -> bool;

    /// Event type this listener wants to install a handler for, if any
    fn reg_type(&self) -> Option<&str> {
        None
    }

    /// Self-installation hook, invoked once per unclaimed `reg_type`
    fn reg(&self, _handler: &mut Handler) -> Result<()> {
        Ok(())
    }
}
