//! Modifier pipeline: ordered, single-use message mutation with audit
//! broadcasts

use crate::entity::EntityHandle;
use crate::error::Result;
use crate::manager::{Broadcast, Dispatch};
use crate::message::{ExtraTag, GameMessage, ModifierArg, ModifierKey, MsgValue};
use crate::value::Value;
use tracing::{debug, trace};

/// Applies a message's pending modifiers strictly in list order
///
/// Modifiers are single-use: the pending list is empty after `process`
/// whether the pipeline succeeded or aborted. After every successful
/// application two broadcasts fire: the mutated message itself to listeners
/// that have not reacted yet this chain, and a synthetic MODIFY audit
/// message to everyone.
#[derive(Debug, Default)]
pub struct MessageProcessor;

impl MessageProcessor {
    /// Create a new processor
    pub fn new() -> Self {
        Self
    }

    /// Run the message through its pending modifiers
    ///
    /// Returns false when a modifier fails to apply; the remaining entries
    /// are dropped and the dispatch tick is expected to halt.
    pub(crate) fn process(&self, d: &mut Dispatch<'_>, msg: &mut GameMessage) -> Result<bool> {
        if msg.modifiers.is_empty() {
            return Ok(true);
        }
        trace!(kind = %msg.kind, phase = %msg.phase, pending = msg.modifiers.len(), "processing modifiers");

        // Work-queue drain: entries appended mid-pipeline (by reacting
        // listeners) run too, and REMOVE_MODIFIER can defuse entries that
        // have not been reached yet.
        while !msg.modifiers.is_empty() {
            let (key, arg) = msg.modifiers.remove(0);
            if !self.apply(d, msg, &key, &arg)? {
                msg.clear_modifiers();
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Apply one modifier and fire the post-application broadcasts
    fn apply(
        &self,
        d: &mut Dispatch<'_>,
        msg: &mut GameMessage,
        key: &ModifierKey,
        arg: &ModifierArg,
    ) -> Result<bool> {
        let (raw, modified) = match key {
            ModifierKey::SetValue => {
                let ModifierArg::Value(v) = arg else {
                    debug!(%key, ?arg, "modifier argument shape mismatch");
                    return Ok(false);
                };
                let new = v.resolve(msg);
                let raw = Value::Int(msg.get_value());
                msg.value = MsgValue::Lit(new);
                (raw, Value::Int(new))
            }
            ModifierKey::SetSender => {
                let ModifierArg::Entity(entity) = arg else {
                    debug!(%key, ?arg, "modifier argument shape mismatch");
                    return Ok(false);
                };
                let raw = entity_name(&msg.sender);
                msg.sender = entity.clone();
                (raw, entity_name(&msg.sender))
            }
            ModifierKey::SetReceiver => {
                let ModifierArg::Entity(entity) = arg else {
                    debug!(%key, ?arg, "modifier argument shape mismatch");
                    return Ok(false);
                };
                let raw = entity_name(&msg.receiver);
                msg.receiver = entity.clone();
                (raw, entity_name(&msg.receiver))
            }
            ModifierKey::UpdateExtra => {
                let ModifierArg::Extra(tag, value) = arg else {
                    debug!(%key, ?arg, "modifier argument shape mismatch");
                    return Ok(false);
                };
                let raw = msg.remove_extra(*tag).unwrap_or(Value::Null);
                msg.add_extra(*tag, value.clone())?;
                (raw, value.clone())
            }
            ModifierKey::RemoveExtra => {
                let ModifierArg::Tag(tag) = arg else {
                    debug!(%key, ?arg, "modifier argument shape mismatch");
                    return Ok(false);
                };
                let raw = msg.remove_extra(*tag).unwrap_or(Value::Null);
                (raw, Value::Null)
            }
            ModifierKey::RemoveModifier => {
                let ModifierArg::Key(target) = arg else {
                    debug!(%key, ?arg, "modifier argument shape mismatch");
                    return Ok(false);
                };
                let removed = msg.remove_modifier(target);
                (
                    Value::Str(target.to_string()),
                    Value::Bool(removed.is_some()),
                )
            }
            ModifierKey::Custom(name) => {
                // Unknown names are configuration errors and propagate; a
                // modifier that ran but reports failure aborts the pipeline.
                let f = d.handler.modifier_fn(name)?;
                let result = {
                    let mut ctx = d.ctx();
                    f(&mut ctx, msg, arg)?
                };
                if !result.ok {
                    debug!(modifier = %name, "custom modifier failed");
                    return Ok(false);
                }
                (result.raw, result.modified)
            }
        };

        // The mutated message goes only to listeners that have not reacted
        // yet this chain; the MODIFY audit message goes to everyone.
        d.broadcast(msg, &Broadcast::New);

        let mut audit = GameMessage::new(d.chain, "MODIFY");
        audit.sender = msg.sender.clone();
        audit.receiver = msg.receiver.clone();
        if let Value::Int(n) = &modified {
            audit.value = MsgValue::Lit(*n);
        }
        audit.add_extra(ExtraTag::ModifyKind, key.to_string())?;
        audit.add_extra(ExtraTag::ModifyValue, modified)?;
        audit.add_extra(ExtraTag::RawValue, raw)?;
        d.broadcast(&mut audit, &Broadcast::All);

        Ok(true)
    }
}

fn entity_name(entity: &Option<EntityHandle>) -> Value {
    entity
        .as_ref()
        .map(|e| Value::Str(e.borrow().name().to_string()))
        .unwrap_or(Value::Null)
}
