//! Game messages and their phase-splitting protocol

use crate::chain::MessageChain;
use crate::entity::EntityHandle;
use crate::error::{Error, Result};
use crate::identity::{ChainId, MsgId, MsgType};
use crate::value::{Value, ValueType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

/// The processing phase of a message
///
/// One logical event runs as three queued sub-steps: PRE (reaction window
/// before resolution), MAIN (the resolution itself) and POST (aftermath).
/// `Unsplit` is the transient state of a freshly built message; the chain
/// decomposes it on insertion and it must never reach a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Phase {
    Pre,
    Main,
    Post,
    #[default]
    Unsplit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pre => "PRE",
            Phase::Main => "MAIN",
            Phase::Post => "POST",
            Phase::Unsplit => "UNSPLIT",
        };
        write!(f, "{}", name)
    }
}

/// Tags for typed extra payload entries on a message
///
/// Each tag declares the value type it carries; writes and reads are checked
/// against it (see [`GameMessage::add_extra`] / [`GameMessage::get_extra`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtraTag {
    /// Resolve this message as a no-op without dispatching it
    Ignore,
    /// Which modifier produced a MODIFY audit message
    ModifyKind,
    /// The value a modifier wrote
    ModifyValue,
    /// The value a modifier replaced
    RawValue,
    /// Damage before crit and dodge resolution
    RawDamage,
    /// Damage after the crit multiplier
    AfterCritDamage,
    /// Whether the attack crit
    Crit,
    /// Whether the attack was dodged
    Dodge,
    /// Flavor of damage ("reflected", "poison", ...)
    DamageType,
}

impl ExtraTag {
    /// The value type this tag requires
    pub fn expected(&self) -> ValueType {
        match self {
            ExtraTag::Ignore => ValueType::Bool,
            ExtraTag::ModifyKind => ValueType::Str,
            ExtraTag::ModifyValue => ValueType::Any,
            ExtraTag::RawValue => ValueType::Any,
            ExtraTag::RawDamage => ValueType::Int,
            ExtraTag::AfterCritDamage => ValueType::Int,
            ExtraTag::Crit => ValueType::Bool,
            ExtraTag::Dodge => ValueType::Bool,
            ExtraTag::DamageType => ValueType::Str,
        }
    }

    /// The wire-ish key name of this tag
    pub fn key(&self) -> &'static str {
        match self {
            ExtraTag::Ignore => "ignore",
            ExtraTag::ModifyKind => "modify_kind",
            ExtraTag::ModifyValue => "modify_value",
            ExtraTag::RawValue => "raw_value",
            ExtraTag::RawDamage => "raw_damage",
            ExtraTag::AfterCritDamage => "after_crit_damage",
            ExtraTag::Crit => "crit",
            ExtraTag::Dodge => "dodge",
            ExtraTag::DamageType => "damage_type",
        }
    }
}

impl fmt::Display for ExtraTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A deferred message value, evaluated against the message when read
pub type ValueFn = Rc<dyn Fn(&GameMessage) -> i64>;

/// The base value of a message: a literal, or a computation deferred until
/// the value is actually read
///
/// Always read through [`GameMessage::get_value`]; never match on the
/// variants in game logic.
#[derive(Clone)]
pub enum MsgValue {
    Lit(i64),
    Deferred(ValueFn),
}

impl MsgValue {
    /// Wrap a deferred computation
    pub fn deferred(f: impl Fn(&GameMessage) -> i64 + 'static) -> Self {
        MsgValue::Deferred(Rc::new(f))
    }

    /// Resolve against a message
    pub fn resolve(&self, msg: &GameMessage) -> i64 {
        match self {
            MsgValue::Lit(v) => *v,
            MsgValue::Deferred(f) => f(msg),
        }
    }
}

impl Default for MsgValue {
    fn default() -> Self {
        MsgValue::Lit(0)
    }
}

impl From<i64> for MsgValue {
    fn from(v: i64) -> Self {
        MsgValue::Lit(v)
    }
}

impl fmt::Debug for MsgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgValue::Lit(v) => write!(f, "Lit({})", v),
            MsgValue::Deferred(_) => write!(f, "Deferred(..)"),
        }
    }
}

/// The key of a pending modifier entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModifierKey {
    /// Replace the message value
    SetValue,
    /// Replace the sender
    SetSender,
    /// Replace the receiver
    SetReceiver,
    /// Insert or replace a tagged extra
    UpdateExtra,
    /// Delete a tagged extra
    RemoveExtra,
    /// Delete a still-pending modifier entry from this message
    RemoveModifier,
    /// Delegate to a registered custom modifier
    Custom(String),
}

impl fmt::Display for ModifierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModifierKey::SetValue => write!(f, "SET_VALUE"),
            ModifierKey::SetSender => write!(f, "SET_SENDER"),
            ModifierKey::SetReceiver => write!(f, "SET_RECEIVER"),
            ModifierKey::UpdateExtra => write!(f, "UPDATE_EXTRA"),
            ModifierKey::RemoveExtra => write!(f, "REMOVE_EXTRA"),
            ModifierKey::RemoveModifier => write!(f, "REMOVE_MODIFIER"),
            ModifierKey::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// The argument attached to a pending modifier entry
///
/// Each built-in modifier expects one specific shape; a mismatched shape is a
/// pipeline failure, not a panic.
#[derive(Clone)]
pub enum ModifierArg {
    /// A literal or deferred value (SET_VALUE, custom modifiers)
    Value(MsgValue),
    /// A replacement participant (SET_SENDER / SET_RECEIVER)
    Entity(Option<EntityHandle>),
    /// A tagged extra to insert or replace (UPDATE_EXTRA)
    Extra(ExtraTag, Value),
    /// A tag to delete (REMOVE_EXTRA)
    Tag(ExtraTag),
    /// A pending modifier key to delete (REMOVE_MODIFIER)
    Key(ModifierKey),
    /// No argument
    None,
}

impl fmt::Debug for ModifierArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModifierArg::Value(v) => write!(f, "Value({:?})", v),
            ModifierArg::Entity(Some(e)) => write!(f, "Entity({})", e.borrow().name()),
            ModifierArg::Entity(None) => write!(f, "Entity(None)"),
            ModifierArg::Extra(tag, v) => write!(f, "Extra({}, {})", tag, v),
            ModifierArg::Tag(tag) => write!(f, "Tag({})", tag),
            ModifierArg::Key(key) => write!(f, "Key({})", key),
            ModifierArg::None => write!(f, "None"),
        }
    }
}

/// A typed event record flowing through a [`MessageChain`]
///
/// Identity (`id`, `chain`, `kind`, `phase`) is fixed at construction; the
/// payload (`value`, `extra`, participants) mutates only through the modifier
/// pipeline or check-body synchronization. `modifiers` is the one field
/// reaction code appends to directly.
#[derive(Clone)]
pub struct GameMessage {
    /// Identity of this message within its chain
    pub id: MsgId,
    /// Identity of the owning chain (validated, never dereferenced)
    pub chain: ChainId,
    /// Event type tag
    pub kind: MsgType,
    /// Base value; read through [`GameMessage::get_value`]
    pub value: MsgValue,
    /// Tagged, type-checked extra payload
    pub extra: Vec<(ExtraTag, Value)>,
    /// Acting entity, if any
    pub sender: Option<EntityHandle>,
    /// Affected entity, if any
    pub receiver: Option<EntityHandle>,
    /// Pending single-use mutation steps
    pub modifiers: Vec<(ModifierKey, ModifierArg)>,
    /// Processing phase
    pub phase: Phase,
    /// Resolved sibling from the previous phase to re-synchronize with
    pub check_body: Option<MsgId>,
}

impl GameMessage {
    /// Create a new unsplit message on a chain
    pub fn new(chain: &MessageChain, kind: impl Into<MsgType>) -> Self {
        Self {
            id: chain.next_msg_id(),
            chain: chain.id(),
            kind: kind.into(),
            value: MsgValue::Lit(0),
            extra: Vec::new(),
            sender: None,
            receiver: None,
            modifiers: Vec::new(),
            phase: Phase::Unsplit,
            check_body: None,
        }
    }

    /// Set a literal value
    pub fn with_value(mut self, value: i64) -> Self {
        self.value = MsgValue::Lit(value);
        self
    }

    /// Set a deferred value
    pub fn with_deferred(mut self, f: impl Fn(&GameMessage) -> i64 + 'static) -> Self {
        self.value = MsgValue::deferred(f);
        self
    }

    /// Set the sender
    pub fn with_sender(mut self, sender: EntityHandle) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Set the receiver
    pub fn with_receiver(mut self, receiver: EntityHandle) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Set the phase
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Resolve the message value
    pub fn get_value(&self) -> i64 {
        self.value.resolve(self)
    }

    /// Append a tagged extra, checking the value against the tag's type
    pub fn add_extra(&mut self, tag: ExtraTag, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if !tag.expected().matches(&value) {
            return Err(Error::TypeMismatch {
                tag,
                expected: tag.expected(),
                got: value.type_name(),
            });
        }
        self.extra.push((tag, value));
        Ok(())
    }

    /// Read the first extra with this tag, re-checking its type
    pub fn get_extra(&self, tag: ExtraTag) -> Result<Option<&Value>> {
        for (t, v) in &self.extra {
            if *t == tag {
                if !tag.expected().matches(v) {
                    return Err(Error::TypeMismatch {
                        tag,
                        expected: tag.expected(),
                        got: v.type_name(),
                    });
                }
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    /// Delete every extra with this tag, returning the first removed value
    pub fn remove_extra(&mut self, tag: ExtraTag) -> Option<Value> {
        let mut removed = None;
        self.extra.retain(|(t, v)| {
            if *t == tag {
                if removed.is_none() {
                    removed = Some(v.clone());
                }
                false
            } else {
                true
            }
        });
        removed
    }

    /// Clear all extras
    pub fn clear_extras(&mut self) {
        self.extra.clear();
    }

    /// Append a pending modifier
    pub fn modify(&mut self, key: ModifierKey, arg: ModifierArg) {
        self.modifiers.push((key, arg));
    }

    /// Delete the first pending modifier with this key
    pub fn remove_modifier(&mut self, key: &ModifierKey) -> Option<(ModifierKey, ModifierArg)> {
        let pos = self.modifiers.iter().position(|(k, _)| k == key)?;
        Some(self.modifiers.remove(pos))
    }

    /// Clear all pending modifiers
    pub fn clear_modifiers(&mut self) {
        self.modifiers.clear();
    }

    /// Split an unsplit message into its PRE, MAIN and POST siblings
    ///
    /// The siblings share the payload and chain together through their check
    /// bodies: MAIN re-synchronizes from PRE, POST from MAIN. Splitting a
    /// message that already carries a phase is an error.
    pub fn split(&self, chain: &MessageChain) -> Result<(Self, Self, Self)> {
        if self.phase != Phase::Unsplit {
            return Err(Error::InvalidPhase(self.phase));
        }
        Ok(self.split_parts(chain))
    }

    pub(crate) fn split_parts(&self, chain: &MessageChain) -> (Self, Self, Self) {
        let mut pre = self.clone();
        pre.id = chain.next_msg_id();
        pre.phase = Phase::Pre;

        let mut main = self.clone();
        main.id = chain.next_msg_id();
        main.phase = Phase::Main;
        main.check_body = Some(pre.id);

        let mut post = self.clone();
        post.id = chain.next_msg_id();
        post.phase = Phase::Post;
        post.check_body = Some(main.id);

        (pre, main, post)
    }
}

impl fmt::Debug for GameMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name_of = |e: &Option<EntityHandle>| -> String {
            e.as_ref()
                .map(|h| h.borrow().name().to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        f.debug_struct("GameMessage")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("value", &self.value)
            .field("sender", &name_of(&self.sender))
            .field("receiver", &name_of(&self.receiver))
            .field("extra", &self.extra)
            .field("modifiers", &self.modifiers.len())
            .field("check_body", &self.check_body)
            .finish()
    }
}
