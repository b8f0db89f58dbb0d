//! Event-type and modifier registries with layered parent lookup
//!
//! A [`Handler`] maps event types to per-phase resolution functions and
//! modifier names to modifier functions, and tracks which combat entities
//! have been registered. A handler built with [`Handler::with_parent`]
//! consults its own tables first and falls back to the parent on a miss;
//! mutations always land in the child layer, so a shared base ruleset stays
//! read-only no matter how many sessions derive from it. Overriding an
//! inherited type copies the parent's slots down before replacing one.

use crate::chain::MessageChain;
use crate::entity::{Attribute, EntityKind, Registrable};
use crate::error::{Error, Result};
use crate::identity::{EntityId, MsgType};
use crate::message::{ExtraTag, GameMessage, ModifierArg, MsgValue, Phase};
use crate::rng::GameRng;
use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::rc::Rc;
use tracing::debug;

/// What the dispatch loop should do after a handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Keep draining the queue
    Continue,
    /// Abort: clear every pending message
    Stop,
    /// Discard the rest of this event, through its POST sibling
    Skip,
    /// Halt this tick but leave the queue intact for corrected input
    ReInput,
}

/// A handler's verdict: an outcome plus a status code and a note
///
/// Expected control flow travels here, never as an error; `code` is zero on
/// success and implementation-defined otherwise.
#[derive(Debug, Clone)]
pub struct HandlerReply {
    pub code: i32,
    pub outcome: Outcome,
    pub note: String,
}

impl HandlerReply {
    /// Successful resolution, keep draining
    pub fn cont() -> Self {
        Self {
            code: 0,
            outcome: Outcome::Continue,
            note: String::new(),
        }
    }

    /// The default placeholder reply
    pub fn noop() -> Self {
        Self {
            code: 0,
            outcome: Outcome::Continue,
            note: "no-op".to_string(),
        }
    }

    /// Abort the whole queue
    pub fn stop(code: i32, note: impl Into<String>) -> Self {
        Self {
            code,
            outcome: Outcome::Stop,
            note: note.into(),
        }
    }

    /// Discard the rest of this event
    pub fn skip(code: i32, note: impl Into<String>) -> Self {
        Self {
            code,
            outcome: Outcome::Skip,
            note: note.into(),
        }
    }

    /// Ask the caller to re-supply input
    pub fn re_input(code: i32, note: impl Into<String>) -> Self {
        Self {
            code,
            outcome: Outcome::ReInput,
            note: note.into(),
        }
    }
}

/// What a custom modifier reports back to the pipeline
#[derive(Debug, Clone)]
pub struct ModifierResult {
    /// The value before modification (for the MODIFY audit broadcast)
    pub raw: Value,
    /// The value after modification
    pub modified: Value,
    /// Whether the modifier applied; false aborts the pipeline
    pub ok: bool,
}

impl ModifierResult {
    /// A successful application
    pub fn applied(raw: impl Into<Value>, modified: impl Into<Value>) -> Self {
        Self {
            raw: raw.into(),
            modified: modified.into(),
            ok: true,
        }
    }

    /// A failed application (aborts the rest of the pipeline)
    pub fn failed() -> Self {
        Self {
            raw: Value::Null,
            modified: Value::Null,
            ok: false,
        }
    }
}

/// The mutable state a handler function, modifier or listener may touch
///
/// Reaction code enqueues follow-up messages through `chain`, registers
/// short-lived modifiers through `handler`, and draws combat rolls from
/// `rng`. All three borrow from the owning session manager.
pub struct EngineCtx<'a> {
    pub chain: &'a mut MessageChain,
    pub handler: &'a mut Handler,
    pub rng: &'a mut GameRng,
}

/// A phase resolution function
pub type HandlerFn = Rc<dyn Fn(&mut EngineCtx<'_>, &mut GameMessage) -> Result<HandlerReply>>;

/// A custom modifier function
pub type ModifierFn =
    Rc<dyn Fn(&mut EngineCtx<'_>, &mut GameMessage, &ModifierArg) -> Result<ModifierResult>>;

fn noop_handler() -> HandlerFn {
    Rc::new(|_, _| Ok(HandlerReply::noop()))
}

/// The three phase slots registered for one event type
#[derive(Clone)]
pub(crate) struct PhaseSlots {
    pre: HandlerFn,
    main: HandlerFn,
    post: HandlerFn,
}

impl Default for PhaseSlots {
    fn default() -> Self {
        Self {
            pre: noop_handler(),
            main: noop_handler(),
            post: noop_handler(),
        }
    }
}

/// Event-type registry, modifier registry and registered-entity sets
pub struct Handler {
    parent: Option<Rc<Handler>>,
    slots: IndexMap<MsgType, PhaseSlots>,
    modifiers: IndexMap<String, ModifierFn>,
    characters: HashSet<EntityId>,
    skills: HashSet<EntityId>,
    items: HashSet<EntityId>,
}

impl Handler {
    /// Create an empty registry with no parent
    pub fn new() -> Self {
        Self {
            parent: None,
            slots: IndexMap::new(),
            modifiers: IndexMap::new(),
            characters: HashSet::new(),
            skills: HashSet::new(),
            items: HashSet::new(),
        }
    }

    /// Create an empty child layered over a shared parent
    pub fn with_parent(parent: Rc<Handler>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new()
        }
    }

    /// Build the base ruleset: ATTACK, DAMAGE and HEAL pre-registered
    ///
    /// Construct this once at session/process start, wrap it in an `Rc`, and
    /// derive per-session handlers from it with [`Handler::with_parent`]; it
    /// is read-mostly after construction.
    pub fn base_ruleset() -> Self {
        let mut base = Handler::new();
        base.install_builtin("ATTACK", attack_handler());
        base.install_builtin("DAMAGE", damage_handler());
        base.install_builtin("HEAL", heal_handler());
        base
    }

    /// Install a MAIN handler for a fresh type; pre/post stay no-ops
    fn install_builtin(&mut self, kind: &str, f: HandlerFn) {
        let slots = self.slots.entry(MsgType::new(kind)).or_default();
        slots.main = f;
    }

    // --- entity registry ---------------------------------------------------

    /// Register a character, skill or item
    ///
    /// If the entity advertises a `reg_type` nobody has claimed yet, its
    /// `reg` hook runs so it can install its own MAIN handler.
    pub fn register(&mut self, entity: &dyn Registrable) -> Result<()> {
        let id = entity.entity_id();
        match entity.kind() {
            EntityKind::Character => self.characters.insert(id),
            EntityKind::Skill => self.skills.insert(id),
            EntityKind::Item => self.items.insert(id),
        };

        if let Some(reg_type) = entity.reg_type() {
            if !self.is_registered_type(reg_type) {
                entity.reg(self)?;
            }
        }
        debug!(entity = %id, kind = %entity.kind(), "entity registered");
        Ok(())
    }

    /// Remove a previously registered entity
    pub fn unregister(&mut self, entity: &dyn Registrable) -> Result<()> {
        let id = entity.entity_id();
        let removed = match entity.kind() {
            EntityKind::Character => self.characters.remove(&id),
            EntityKind::Skill => self.skills.remove(&id),
            EntityKind::Item => self.items.remove(&id),
        };
        if !removed {
            return Err(Error::InvalidEntity(format!(
                "{} {} is not registered",
                entity.kind(),
                id
            )));
        }
        debug!(entity = %id, "entity unregistered");
        Ok(())
    }

    /// Membership check across this layer and its parents
    pub fn is_registered(&self, entity: &dyn Registrable) -> bool {
        let id = entity.entity_id();
        let here = match entity.kind() {
            EntityKind::Character => self.characters.contains(&id),
            EntityKind::Skill => self.skills.contains(&id),
            EntityKind::Item => self.items.contains(&id),
        };
        here || self
            .parent
            .as_deref()
            .is_some_and(|p| p.is_registered(entity))
    }

    // --- type registry -----------------------------------------------------

    /// Register a phase handler for an event type
    ///
    /// PRE/POST registration requires MAIN to exist for that type already.
    /// The first registration of a brand-new type fills the other phases
    /// with no-ops.
    pub fn register_type(
        &mut self,
        kind: impl Into<MsgType>,
        f: HandlerFn,
        phase: Phase,
    ) -> Result<()> {
        let kind = kind.into();
        if phase == Phase::Unsplit {
            return Err(Error::InvalidPhase(phase));
        }
        if phase != Phase::Main && !self.is_registered_type(kind.as_str()) {
            return Err(Error::UnregisteredPrerequisite { kind, phase });
        }

        let slots = self.entry_slots(&kind);
        match phase {
            Phase::Pre => slots.pre = f,
            Phase::Main => slots.main = f,
            Phase::Post => slots.post = f,
            Phase::Unsplit => unreachable!(),
        }
        debug!(%kind, %phase, "handler registered");
        Ok(())
    }

    /// Overwrite one phase slot of an already-registered type
    pub fn replace_type(&mut self, kind: &str, f: HandlerFn, phase: Phase) -> Result<()> {
        if phase == Phase::Unsplit {
            return Err(Error::InvalidPhase(phase));
        }
        if !self.is_registered_type(kind) {
            return Err(Error::NotRegistered(kind.to_string()));
        }

        let kind = MsgType::new(kind);
        let slots = self.entry_slots(&kind);
        match phase {
            Phase::Pre => slots.pre = f,
            Phase::Main => slots.main = f,
            Phase::Post => slots.post = f,
            Phase::Unsplit => unreachable!(),
        }
        debug!(%kind, %phase, "handler replaced");
        Ok(())
    }

    /// Remove an event type and all three of its phase slots
    ///
    /// Mutations are layer-local: a type living only in the shared parent
    /// cannot be removed through a child and reports `NotRegistered`.
    pub fn unregister_type(&mut self, kind: &str) -> Result<()> {
        if self.slots.shift_remove(kind).is_none() {
            return Err(Error::NotRegistered(kind.to_string()));
        }
        debug!(kind, "handler unregistered");
        Ok(())
    }

    /// Whether an event type is registered in this layer or a parent
    pub fn is_registered_type(&self, kind: &str) -> bool {
        self.slots.contains_key(kind)
            || self
                .parent
                .as_deref()
                .is_some_and(|p| p.is_registered_type(kind))
    }

    /// Look up the resolution function for a kind/phase pair
    pub fn slot(&self, kind: &str, phase: Phase) -> Result<HandlerFn> {
        if phase == Phase::Unsplit {
            return Err(Error::InvalidPhase(phase));
        }
        let slots = self
            .find_slots(kind)
            .ok_or_else(|| Error::NotRegistered(format!("{} {} handler", kind, phase)))?;
        Ok(match phase {
            Phase::Pre => slots.pre.clone(),
            Phase::Main => slots.main.clone(),
            Phase::Post => slots.post.clone(),
            Phase::Unsplit => unreachable!(),
        })
    }

    fn find_slots(&self, kind: &str) -> Option<&PhaseSlots> {
        self.slots
            .get(kind)
            .or_else(|| self.parent.as_deref()?.find_slots(kind))
    }

    /// Slots for a type in this layer, copying a parent's entry down first
    fn entry_slots(&mut self, kind: &MsgType) -> &mut PhaseSlots {
        let parent = &self.parent;
        self.slots.entry(kind.clone()).or_insert_with(|| {
            parent
                .as_deref()
                .and_then(|p| p.find_slots(kind.as_str()))
                .cloned()
                .unwrap_or_default()
        })
    }

    // --- modifier registry -------------------------------------------------

    /// Install a named custom modifier
    pub fn register_modifier(&mut self, name: impl Into<String>, f: ModifierFn) {
        let name = name.into();
        debug!(modifier = %name, "modifier registered");
        self.modifiers.insert(name, f);
    }

    /// Remove a named custom modifier; idempotent, returns whether it existed
    ///
    /// Short-lived modifiers are expected to unregister themselves after
    /// firing, so a missing name is not an error here.
    pub fn unregister_modifier(&mut self, name: &str) -> bool {
        let removed = self.modifiers.shift_remove(name).is_some();
        if removed {
            debug!(modifier = name, "modifier unregistered");
        }
        removed
    }

    /// Whether a modifier name is registered in this layer or a parent
    pub fn is_registered_modifier(&self, name: &str) -> bool {
        self.modifiers.contains_key(name)
            || self
                .parent
                .as_deref()
                .is_some_and(|p| p.is_registered_modifier(name))
    }

    /// Look up a custom modifier function
    pub fn modifier_fn(&self, name: &str) -> Result<ModifierFn> {
        if let Some(f) = self.modifiers.get(name) {
            return Ok(f.clone());
        }
        self.parent
            .as_deref()
            .map(|p| p.modifier_fn(name))
            .unwrap_or_else(|| Err(Error::NotRegistered(format!("modifier {}", name))))
    }

    /// Wipe this layer: types, modifiers and entity sets (parents untouched)
    pub fn clear(&mut self) {
        self.slots.clear();
        self.modifiers.clear();
        self.characters.clear();
        self.skills.clear();
        self.items.clear();
        debug!("handler layer cleared");
    }
}

impl Default for Handler {
    fn default() -> Self {
        Self::new()
    }
}

// --- built-in combat handlers ----------------------------------------------

/// ATTACK resolution: crit and dodge rolls, then an immediate DAMAGE message
fn attack_handler() -> HandlerFn {
    Rc::new(|ctx, msg| {
        let (Some(sender), Some(receiver)) = (msg.sender.clone(), msg.receiver.clone()) else {
            return Ok(HandlerReply::skip(-1, "attack without attacker or receiver"));
        };

        let mut ret = GameMessage::new(ctx.chain, "DAMAGE")
            .with_sender(sender.clone())
            .with_receiver(receiver.clone());

        // Base formula: max(attack - defense, 0), unless the attack message
        // carries an explicit positive value.
        let mut dmg = {
            let s = sender.borrow();
            let r = receiver.borrow();
            (s.attack() - r.defense()).max(0)
        };
        if msg.get_value() > 0 {
            dmg = msg.get_value();
        }
        ret.add_extra(ExtraTag::RawDamage, dmg)?;

        let (critical, critical_damage) = {
            let s = sender.borrow();
            (s.critical(), s.critical_damage())
        };
        if ctx.rng.range_i64(1, 100) <= critical {
            dmg *= critical_damage / 100;
            ret.add_extra(ExtraTag::Crit, true)?;
            debug!(attacker = sender.borrow().name(), dmg, "critical hit");
        } else {
            ret.add_extra(ExtraTag::Crit, false)?;
        }
        ret.add_extra(ExtraTag::AfterCritDamage, dmg)?;

        let evasion = receiver.borrow().evasion();
        if ctx.rng.range_i64(100, 200) <= 100 + evasion {
            dmg = 0;
            ret.add_extra(ExtraTag::Dodge, true)?;
            debug!(defender = receiver.borrow().name(), "attack dodged");
        } else {
            ret.add_extra(ExtraTag::Dodge, false)?;
        }

        ret.value = MsgValue::Lit(dmg);
        ctx.chain.accept(ret);
        Ok(HandlerReply::cont())
    })
}

/// DAMAGE resolution: apply a negative hp delta to the receiver
fn damage_handler() -> HandlerFn {
    Rc::new(|_ctx, msg| {
        let has_value = !matches!(msg.value, MsgValue::Lit(0));
        if let (Some(receiver), true) = (&msg.receiver, has_value) {
            let amount = msg.get_value();
            receiver
                .borrow_mut()
                .change_attribute(Attribute::CurrentHp, -amount);
            debug!(
                receiver = receiver.borrow().name(),
                amount,
                hp = receiver.borrow().current_hp(),
                "damage applied"
            );
            return Ok(HandlerReply::cont());
        }
        Ok(HandlerReply::re_input(-1, "damage without receiver or value"))
    })
}

/// HEAL resolution: apply a positive hp delta to the receiver
fn heal_handler() -> HandlerFn {
    Rc::new(|_ctx, msg| {
        let has_value = !matches!(msg.value, MsgValue::Lit(0));
        if let (Some(receiver), true) = (&msg.receiver, has_value) {
            let amount = msg.get_value();
            if amount > 0 {
                receiver
                    .borrow_mut()
                    .change_attribute(Attribute::CurrentHp, amount);
                debug!(
                    receiver = receiver.borrow().name(),
                    amount,
                    hp = receiver.borrow().current_hp(),
                    "heal applied"
                );
                return Ok(HandlerReply::cont());
            }
        }
        Ok(HandlerReply::re_input(
            -1,
            "heal without receiver or positive value",
        ))
    })
}
