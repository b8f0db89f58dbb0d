//! Session manager: drives the accept -> broadcast -> process -> resolve loop

use crate::chain::MessageChain;
use crate::entity::Listener;
use crate::error::{Error, Result};
use crate::handler::{EngineCtx, Handler, Outcome};
use crate::identity::ListenerId;
use crate::message::{ExtraTag, GameMessage, Phase};
use crate::processor::MessageProcessor;
use crate::rng::GameRng;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Tunables for one dispatch session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Watchdog ceiling, enforced against the pending queue depth and the
    /// number of messages resolved in one drain
    pub max_queue_len: usize,
    /// Seed for the session RNG
    pub rng_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_len: 1000,
            rng_seed: 12345,
        }
    }
}

/// Which listeners a broadcast reaches
///
/// The `*New` variants additionally exclude listeners already present in the
/// chain's reacted ledger, so an already-reacted listener cannot double-react
/// to a mutated message.
#[derive(Debug, Clone)]
pub enum Broadcast {
    /// Every listener
    All,
    /// Listeners absent from the reacted ledger
    New,
    /// An explicit subset
    Certain(HashSet<ListenerId>),
    /// An explicit subset, filtered by the reacted ledger
    CertainNew(HashSet<ListenerId>),
    /// Everyone outside an explicit subset
    Except(HashSet<ListenerId>),
    /// Everyone outside an explicit subset, filtered by the reacted ledger
    ExceptNew(HashSet<ListenerId>),
}

/// Split-borrow view over a manager's moving parts
///
/// Broadcast iterates the roster mutably while listeners mutate the chain,
/// the session handler and the RNG through an [`EngineCtx`]; keeping the
/// roster and the context fields as separate borrows makes that legal.
pub(crate) struct Dispatch<'a> {
    pub listeners: &'a mut Vec<Box<dyn Listener>>,
    pub chain: &'a mut MessageChain,
    pub handler: &'a mut Handler,
    pub rng: &'a mut GameRng,
}

impl Dispatch<'_> {
    /// Reborrow the context fields for a handler/modifier/listener call
    pub(crate) fn ctx(&mut self) -> EngineCtx<'_> {
        EngineCtx {
            chain: &mut *self.chain,
            handler: &mut *self.handler,
            rng: &mut *self.rng,
        }
    }

    /// Deliver a message to the selected listeners
    pub(crate) fn broadcast(&mut self, msg: &mut GameMessage, mode: &Broadcast) {
        trace!(kind = %msg.kind, phase = %msg.phase, ?mode, "broadcast");
        for i in 0..self.listeners.len() {
            let id = self.listeners[i].listener_id();
            let selected = match mode {
                Broadcast::All => true,
                Broadcast::New => !self.chain.is_reacted(id),
                Broadcast::Certain(set) => set.contains(&id),
                Broadcast::CertainNew(set) => set.contains(&id) && !self.chain.is_reacted(id),
                Broadcast::Except(set) => !set.contains(&id),
                Broadcast::ExceptNew(set) => !set.contains(&id) && !self.chain.is_reacted(id),
            };
            if !selected {
                continue;
            }
            let reacted = {
                let mut ctx = EngineCtx {
                    chain: &mut *self.chain,
                    handler: &mut *self.handler,
                    rng: &mut *self.rng,
                };
                self.listeners[i].update(&mut ctx, msg)
            };
            if reacted {
                self.chain.update_reacted(id);
                trace!(listener = %id, "listener reacted");
            }
        }
    }
}

/// Orchestrator for one game session
///
/// Owns a [`MessageChain`], a session [`Handler`] layered over a shared base
/// ruleset, a [`MessageProcessor`] and the listener roster, and drains the
/// queue one message at a time. Not thread-safe by design: wrap a whole
/// manager in one exclusive lock per session if the host is multi-threaded.
pub struct MessageManager {
    base: Rc<Handler>,
    handler: Handler,
    chain: MessageChain,
    processor: MessageProcessor,
    listeners: Vec<Box<dyn Listener>>,
    rng: GameRng,
    config: EngineConfig,
}

impl MessageManager {
    /// Create a manager over a shared base ruleset
    pub fn new(base: Rc<Handler>) -> Self {
        Self::with_config(base, EngineConfig::default())
    }

    /// Create a manager with explicit configuration
    pub fn with_config(base: Rc<Handler>, config: EngineConfig) -> Self {
        Self {
            handler: Handler::with_parent(base.clone()),
            base,
            chain: MessageChain::new(),
            processor: MessageProcessor::new(),
            listeners: Vec::new(),
            rng: GameRng::new(config.rng_seed),
            config,
        }
    }

    /// The session handler (child layer over the base ruleset)
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Mutable access to the session handler
    pub fn handler_mut(&mut self) -> &mut Handler {
        &mut self.handler
    }

    /// The session chain
    pub fn chain(&self) -> &MessageChain {
        &self.chain
    }

    /// Mutable access to the session chain
    pub fn chain_mut(&mut self) -> &mut MessageChain {
        &mut self.chain
    }

    /// Current configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Adjust the watchdog ceiling
    pub fn set_queue_limit(&mut self, limit: usize) {
        self.config.max_queue_len = limit;
    }

    // --- listener roster ---------------------------------------------------

    /// Register a broadcast listener
    ///
    /// A listener advertising an unclaimed `reg_type` installs its handler
    /// on the session layer first.
    pub fn register(&mut self, listener: Box<dyn Listener>) -> Result<()> {
        if let Some(reg_type) = listener.reg_type() {
            if !self.handler.is_registered_type(reg_type) {
                listener.reg(&mut self.handler)?;
            }
        }
        debug!(listener = %listener.listener_id(), "listener registered");
        self.listeners.push(listener);
        Ok(())
    }

    /// Remove a listener from the roster
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.listener_id() != id);
        before != self.listeners.len()
    }

    /// Drop every listener
    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // --- queue entry points ------------------------------------------------

    /// Accept an immediate message (front of the queue)
    pub fn accept(&mut self, msg: GameMessage) {
        debug!(kind = %msg.kind, "message accepted");
        self.chain.accept(msg);
    }

    /// Accept a deferred message (back of the queue)
    pub fn accept_deferred(&mut self, msg: GameMessage) {
        debug!(kind = %msg.kind, "deferred message accepted");
        self.chain.accept_deferred(msg);
    }

    /// Number of pending messages
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Deliver a message to listeners without queueing it
    pub fn broadcast(&mut self, msg: &mut GameMessage, mode: &Broadcast) {
        let Self {
            listeners,
            chain,
            handler,
            rng,
            ..
        } = self;
        let mut d = Dispatch {
            listeners,
            chain,
            handler,
            rng,
        };
        d.broadcast(msg, mode);
    }

    // --- dispatch loop -----------------------------------------------------

    /// Pop and resolve one message
    ///
    /// Returns true when draining should continue: the popped message ran
    /// through broadcast, the modifier pipeline and its phase handler, and
    /// everything reported continue. Returns false when the queue is empty
    /// or the tick halted (failed validation, pipeline abort, or a
    /// non-continue outcome).
    pub fn execute_one(&mut self) -> Result<bool> {
        let limit = self.config.max_queue_len;
        let pending = self.chain.len();
        let resolved = self.chain.history_len();
        if pending > limit || resolved > limit {
            warn!(pending, resolved, limit, "runaway chain detected");
            return Err(Error::RunawayChain {
                count: pending.max(resolved),
                limit,
            });
        }

        let Some(mut msg) = self.chain.pop() else {
            return Ok(false);
        };
        if !self.sync_check_body(&mut msg) {
            return Ok(false);
        }

        // Explicitly ignored messages resolve without dispatch.
        if matches!(msg.get_extra(ExtraTag::Ignore)?, Some(Value::Bool(true))) {
            debug!(kind = %msg.kind, phase = %msg.phase, "message ignored");
            self.chain.record(msg);
            return Ok(true);
        }

        trace!(kind = %msg.kind, phase = %msg.phase, "executing message");
        let Self {
            listeners,
            chain,
            handler,
            rng,
            processor,
            ..
        } = self;
        let mut d = Dispatch {
            listeners,
            chain,
            handler,
            rng,
        };
        d.broadcast(&mut msg, &Broadcast::All);

        let keep_going = if processor.process(&mut d, &mut msg)? {
            Self::resolve(&mut d, &mut msg)?
        } else {
            debug!(kind = %msg.kind, "modifier pipeline aborted");
            false
        };

        self.chain.record(msg);
        Ok(keep_going)
    }

    /// Drain the queue, then reset the chain so the manager can be reused
    ///
    /// A watchdog trip resets the chain and surfaces [`Error::RunawayChain`];
    /// the registries are left intact either way.
    pub fn execute_all(&mut self) -> Result<()> {
        loop {
            match self.execute_one() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    self.chain.reset();
                    return Err(err);
                }
            }
        }
        self.chain.reset();
        Ok(())
    }

    /// Clear listeners, reset the chain and rebuild the session handler
    /// layer over the same base ruleset
    pub fn reset(&mut self) {
        self.clear_listeners();
        self.handler = Handler::with_parent(self.base.clone());
        self.chain.reset();
        debug!("manager reset");
    }

    /// Re-synchronize a phase-split message with its resolved sibling
    ///
    /// The check body must be resolved already and agree on kind and owning
    /// chain; its final payload then overwrites this message, carrying PRE
    /// mutations into MAIN and MAIN's into POST. A missing or mismatched
    /// body fails validation and the message is dropped as a no-op.
    fn sync_check_body(&self, msg: &mut GameMessage) -> bool {
        let Some(check_id) = msg.check_body else {
            return true;
        };
        let Some(body) = self.chain.resolved_by_id(check_id) else {
            debug!(%check_id, kind = %msg.kind, "check body unresolved; dropping message");
            return false;
        };
        if body.kind != msg.kind || body.chain != msg.chain {
            debug!(%check_id, kind = %msg.kind, "check body mismatch; dropping message");
            return false;
        }
        msg.value = body.value.clone();
        msg.extra = body.extra.clone();
        msg.sender = body.sender.clone();
        msg.receiver = body.receiver.clone();
        msg.modifiers = body.modifiers.clone();
        true
    }

    /// Dispatch to the phase handler and interpret its outcome
    fn resolve(d: &mut Dispatch<'_>, msg: &mut GameMessage) -> Result<bool> {
        let f = d.handler.slot(msg.kind.as_str(), msg.phase)?;
        let reply = {
            let mut ctx = d.ctx();
            f(&mut ctx, msg)?
        };
        if reply.code != 0 {
            debug!(code = reply.code, note = %reply.note, "handler reported an error");
        }
        match reply.outcome {
            Outcome::Continue => Ok(true),
            Outcome::Stop => {
                debug!("stop: clearing the remaining queue");
                d.chain.clear();
                Ok(false)
            }
            Outcome::Skip => {
                debug!(kind = %msg.kind, "skip: discarding through the matching POST");
                while let Some(next) = d.chain.pop() {
                    if next.kind == msg.kind && next.phase == Phase::Post {
                        break;
                    }
                }
                Ok(false)
            }
            Outcome::ReInput => Ok(false),
        }
    }
}

impl Default for MessageManager {
    fn default() -> Self {
        Self::new(Rc::new(Handler::base_ruleset()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerFn, HandlerReply, ModifierFn, ModifierResult};
    use crate::message::{ModifierArg, ModifierKey, MsgValue};
    use crate::testkit::{heal_listener, hp, thorn_listener, FnListener, TestCharacter};
    use crate::{same_entity, EntityHandle};
    use std::cell::{Cell, RefCell};

    fn seeded(seed: u64) -> MessageManager {
        MessageManager::with_config(
            Rc::new(Handler::base_ruleset()),
            EngineConfig {
                rng_seed: seed,
                ..Default::default()
            },
        )
    }

    fn warrior() -> EntityHandle {
        TestCharacter::new("warrior").with_attack(20).into_handle()
    }

    fn mage() -> EntityHandle {
        TestCharacter::new("mage").with_defense(0).into_handle()
    }

    fn cont_handler() -> HandlerFn {
        Rc::new(|_, _| Ok(HandlerReply::cont()))
    }

    // Seed 1 rolls 62 then 188: with critical 5 and evasion 5 neither the
    // crit nor the dodge fires, so attack arithmetic is exact.

    #[test]
    fn test_attack_resolves_to_damage() {
        let mut m = seeded(1);
        let attacker = warrior();
        let defender = mage();

        let msg = GameMessage::new(m.chain(), "ATTACK")
            .with_sender(attacker.clone())
            .with_receiver(defender.clone());
        m.accept(msg);
        m.execute_all().unwrap();

        assert_eq!(hp(&defender), 80);
        assert_eq!(hp(&attacker), 100);
    }

    #[test]
    fn test_attack_records_combat_extras() {
        let mut m = seeded(1);
        let attacker = warrior();
        let defender = mage();

        let msg = GameMessage::new(m.chain(), "ATTACK")
            .with_sender(attacker)
            .with_receiver(defender);
        m.accept(msg);

        m.execute_one().unwrap(); // ATTACK PRE
        m.execute_one().unwrap(); // ATTACK MAIN emits the DAMAGE triplet

        let damage = m.chain().find_message("DAMAGE", Phase::Main, 1).unwrap();
        assert_eq!(damage.get_value(), 20);
        assert_eq!(
            damage.get_extra(ExtraTag::RawDamage).unwrap(),
            Some(&Value::Int(20))
        );
        assert_eq!(
            damage.get_extra(ExtraTag::AfterCritDamage).unwrap(),
            Some(&Value::Int(20))
        );
        assert_eq!(
            damage.get_extra(ExtraTag::Crit).unwrap(),
            Some(&Value::Bool(false))
        );
        assert_eq!(
            damage.get_extra(ExtraTag::Dodge).unwrap(),
            Some(&Value::Bool(false))
        );
    }

    #[test]
    fn test_guaranteed_crit_doubles_damage() {
        let mut m = seeded(1);
        let attacker = TestCharacter::new("assassin")
            .with_attack(20)
            .with_critical(100)
            .into_handle();
        let defender = mage();

        let msg = GameMessage::new(m.chain(), "ATTACK")
            .with_sender(attacker)
            .with_receiver(defender.clone());
        m.accept(msg);
        m.execute_all().unwrap();

        // critical_damage 200 -> x2 multiplier.
        assert_eq!(hp(&defender), 60);
    }

    #[test]
    fn test_guaranteed_dodge_negates_damage() {
        let mut m = seeded(1);
        let attacker = warrior();
        let defender = TestCharacter::new("dancer")
            .with_defense(0)
            .with_evasion(100)
            .into_handle();

        let msg = GameMessage::new(m.chain(), "ATTACK")
            .with_sender(attacker)
            .with_receiver(defender.clone());
        m.accept(msg);
        m.execute_all().unwrap();

        assert_eq!(hp(&defender), 100);
    }

    #[test]
    fn test_attack_without_participants_skips() {
        let mut m = seeded(1);
        let defender = mage();

        // No sender: the ATTACK handler skips the event.
        let msg = GameMessage::new(m.chain(), "ATTACK").with_receiver(defender.clone());
        m.accept(msg);
        m.execute_all().unwrap();

        assert_eq!(hp(&defender), 100);
        assert!(m.is_empty());
    }

    #[test]
    fn test_reflect_heal_chain_regression() {
        let mut m = seeded(1);
        let attacker = warrior();
        let defender = mage();

        m.register(thorn_listener(1, defender.clone())).unwrap();
        m.register(heal_listener(2, defender.clone())).unwrap();
        m.register(thorn_listener(3, attacker.clone())).unwrap();
        m.register(heal_listener(4, attacker.clone())).unwrap();

        let msg = GameMessage::new(m.chain(), "ATTACK")
            .with_sender(attacker.clone())
            .with_receiver(defender.clone());
        m.accept(msg);
        m.execute_all().unwrap();

        // 20 damage lands, 6 reflects back, 1 reflects again (then the 30%
        // floor cuts the chain); each hit heals its victim for 1.
        assert_eq!(hp(&defender), 81);
        assert_eq!(hp(&attacker), 95);
    }

    #[test]
    fn test_phase_order_pre_buff_post_heal() {
        let mut m = seeded(1);
        let attacker = warrior();
        let defender = mage();

        let pre = FnListener::boxed(1, |_, msg| {
            if msg.kind.as_str() == "DAMAGE" && msg.phase == Phase::Pre {
                let buffed = msg.get_value() + 5;
                msg.modify(
                    ModifierKey::SetValue,
                    ModifierArg::Value(MsgValue::Lit(buffed)),
                );
                return true;
            }
            false
        });
        let owner = defender.clone();
        let post = FnListener::boxed(2, move |ctx, msg| {
            if msg.kind.as_str() == "DAMAGE" && msg.phase == Phase::Post {
                let heal = msg.get_value() / 10;
                let heal_msg = GameMessage::new(ctx.chain, "HEAL")
                    .with_sender(owner.clone())
                    .with_receiver(owner.clone())
                    .with_value(heal);
                ctx.chain.accept(heal_msg);
                return true;
            }
            false
        });
        m.register(pre).unwrap();
        m.register(post).unwrap();

        let msg = GameMessage::new(m.chain(), "DAMAGE")
            .with_sender(attacker)
            .with_receiver(defender.clone())
            .with_value(10);
        m.accept(msg);
        m.execute_all().unwrap();

        // PRE buffs 10 -> 15; POST heals 15 / 10 = 1.
        assert_eq!(hp(&defender), 86);
    }

    #[test]
    fn test_set_value_modifier() {
        let mut m = seeded(1);
        let defender = mage();

        let mut msg = GameMessage::new(m.chain(), "DAMAGE")
            .with_receiver(defender.clone())
            .with_value(3);
        msg.modify(ModifierKey::SetValue, ModifierArg::Value(MsgValue::Lit(42)));
        m.accept(msg);

        // The pipeline runs when the PRE sibling is popped.
        m.execute_one().unwrap();
        let pre = m.chain().history().last().unwrap();
        assert_eq!(pre.get_value(), 42);
        assert!(pre.modifiers.is_empty());

        m.execute_all().unwrap();
        assert_eq!(hp(&defender), 58);
    }

    #[test]
    fn test_modify_audit_broadcast() {
        let mut m = seeded(1);
        let defender = mage();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let audit = FnListener::boxed(9, move |_, msg| {
            if msg.kind.as_str() == "MODIFY" {
                let kind = msg.get_extra(ExtraTag::ModifyKind).unwrap().cloned();
                let modified = msg.get_extra(ExtraTag::ModifyValue).unwrap().cloned();
                let raw = msg.get_extra(ExtraTag::RawValue).unwrap().cloned();
                sink.borrow_mut().push((kind, modified, raw));
                return true;
            }
            false
        });
        m.register(audit).unwrap();

        let mut msg = GameMessage::new(m.chain(), "DAMAGE")
            .with_receiver(defender)
            .with_value(3);
        msg.modify(ModifierKey::SetValue, ModifierArg::Value(MsgValue::Lit(42)));
        m.accept(msg);
        m.execute_all().unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            (
                Some(Value::Str("SET_VALUE".into())),
                Some(Value::Int(42)),
                Some(Value::Int(3)),
            )
        );
    }

    #[test]
    fn test_listener_reaction_controls_ledger() {
        let mut m = seeded(1);
        m.register(FnListener::boxed(5, |_, _| false)).unwrap();
        m.register(FnListener::boxed(6, |_, _| true)).unwrap();

        let mut msg = GameMessage::new(m.chain(), "PING");
        m.broadcast(&mut msg, &Broadcast::All);

        assert!(!m.chain().is_reacted(ListenerId::new(5)));
        assert!(m.chain().is_reacted(ListenerId::new(6)));
        assert_eq!(m.chain().reacted_count(ListenerId::new(6)), 1);
    }

    #[test]
    fn test_broadcast_subset_modes() {
        let mut m = seeded(1);
        let hits_a = Rc::new(Cell::new(0));
        let hits_b = Rc::new(Cell::new(0));

        let a = hits_a.clone();
        m.register(FnListener::boxed(1, move |_, _| {
            a.set(a.get() + 1);
            true
        }))
        .unwrap();
        let b = hits_b.clone();
        m.register(FnListener::boxed(2, move |_, _| {
            b.set(b.get() + 1);
            true
        }))
        .unwrap();

        let only_one: HashSet<ListenerId> = [ListenerId::new(1)].into();
        let mut msg = GameMessage::new(m.chain(), "PING");

        m.broadcast(&mut msg, &Broadcast::Certain(only_one.clone()));
        assert_eq!((hits_a.get(), hits_b.get()), (1, 0));

        m.broadcast(&mut msg, &Broadcast::Except(only_one.clone()));
        assert_eq!((hits_a.get(), hits_b.get()), (1, 1));

        // Both already reacted: "new" modes deliver to neither.
        m.broadcast(&mut msg, &Broadcast::New);
        m.broadcast(&mut msg, &Broadcast::CertainNew(only_one));
        assert_eq!((hits_a.get(), hits_b.get()), (1, 1));
    }

    #[test]
    fn test_self_removing_modifier() {
        let mut m = seeded(1);
        let defender = mage();

        let double: ModifierFn = Rc::new(|ctx, msg, _arg| {
            let raw = msg.get_value();
            msg.value = MsgValue::Lit(raw * 2);
            ctx.handler.unregister_modifier("double_once");
            Ok(ModifierResult::applied(raw, raw * 2))
        });
        m.handler_mut().register_modifier("double_once", double);

        let mut msg = GameMessage::new(m.chain(), "DAMAGE")
            .with_receiver(defender.clone())
            .with_value(10);
        msg.modify(ModifierKey::Custom("double_once".into()), ModifierArg::None);
        m.accept(msg);
        m.execute_all().unwrap();

        assert_eq!(hp(&defender), 80);
        assert!(!m.handler().is_registered_modifier("double_once"));
    }

    #[test]
    fn test_unknown_modifier_is_fatal() {
        let mut m = seeded(1);
        let defender = mage();

        let mut msg = GameMessage::new(m.chain(), "DAMAGE")
            .with_receiver(defender.clone())
            .with_value(10);
        msg.modify(ModifierKey::Custom("missing".into()), ModifierArg::None);
        m.accept(msg);

        let err = m.execute_all().unwrap_err();
        assert!(matches!(err, Error::NotRegistered(_)));
        assert!(m.is_empty());
        assert_eq!(hp(&defender), 100);
    }

    #[test]
    fn test_stop_clears_queue() {
        let mut m = seeded(1);
        let defender = mage();

        m.handler_mut()
            .register_type(
                "HALT",
                Rc::new(|_, _| Ok(HandlerReply::stop(0, "halted"))),
                Phase::Main,
            )
            .unwrap();

        m.accept_deferred(GameMessage::new(m.chain(), "HALT"));
        m.accept_deferred(
            GameMessage::new(m.chain(), "DAMAGE")
                .with_receiver(defender.clone())
                .with_value(10),
        );
        m.execute_all().unwrap();

        assert_eq!(hp(&defender), 100);
        assert!(m.is_empty());
    }

    #[test]
    fn test_skip_discards_interleaved_messages() {
        let mut m = seeded(1);
        let defender = mage();

        m.handler_mut()
            .register_type(
                "TRAP",
                Rc::new(|_, _| Ok(HandlerReply::skip(-1, "trap fizzled"))),
                Phase::Main,
            )
            .unwrap();

        // Reacts to TRAP MAIN by queueing damage ahead of TRAP POST; the
        // skip then discards that whole interleaved event too.
        let victim = defender.clone();
        let opportunist = FnListener::boxed(1, move |ctx, msg| {
            if msg.kind.as_str() == "TRAP" && msg.phase == Phase::Main {
                let dmg = GameMessage::new(ctx.chain, "DAMAGE")
                    .with_receiver(victim.clone())
                    .with_value(10);
                ctx.chain.accept(dmg);
                return true;
            }
            false
        });
        m.register(opportunist).unwrap();

        m.accept(GameMessage::new(m.chain(), "TRAP"));
        m.execute_all().unwrap();

        assert_eq!(hp(&defender), 100);
        assert!(m.is_empty());
    }

    #[test]
    fn test_re_input_leaves_queue_intact() {
        let mut m = seeded(1);

        // No receiver: DAMAGE MAIN asks for re-input.
        let msg = GameMessage::new(m.chain(), "DAMAGE").with_value(5);
        m.accept(msg);

        assert!(m.execute_one().unwrap()); // PRE no-op
        assert!(!m.execute_one().unwrap()); // MAIN halts the tick
        assert_eq!(m.len(), 1); // POST still queued
    }

    #[test]
    fn test_runaway_reflect_chain_aborts() {
        let mut m = seeded(1);
        let attacker = TestCharacter::new("warrior")
            .with_attack(20)
            .with_hp(1_000_000)
            .into_handle();
        let defender = TestCharacter::new("mage")
            .with_defense(0)
            .with_hp(1_000_000)
            .into_handle();

        // Full-value reflection with no damage floor on both sides.
        let full_reflect = |id: u64, owner: EntityHandle| {
            FnListener::boxed(id, move |ctx, msg| {
                let mine = msg
                    .receiver
                    .as_ref()
                    .is_some_and(|r| same_entity(r, &owner));
                let from_other = msg
                    .sender
                    .as_ref()
                    .is_some_and(|s| !same_entity(s, &owner));
                if msg.kind.as_str() == "DAMAGE"
                    && msg.phase == Phase::Post
                    && mine
                    && from_other
                    && owner.borrow().current_hp() > 0
                {
                    let back = GameMessage::new(ctx.chain, "DAMAGE")
                        .with_sender(owner.clone())
                        .with_receiver(msg.sender.clone().unwrap())
                        .with_value(msg.get_value());
                    ctx.chain.accept(back);
                    return true;
                }
                false
            })
        };
        m.register(full_reflect(1, attacker.clone())).unwrap();
        m.register(full_reflect(2, defender.clone())).unwrap();
        m.set_queue_limit(200);

        let msg = GameMessage::new(m.chain(), "ATTACK")
            .with_sender(attacker)
            .with_receiver(defender)
            .with_value(11);
        m.accept(msg);

        let err = m.execute_all().unwrap_err();
        assert!(matches!(err, Error::RunawayChain { limit: 200, .. }));
        // The chain is left clean for reuse.
        assert!(m.is_empty());
        assert_eq!(m.chain().history_len(), 0);
    }

    #[test]
    fn test_execute_all_resets_chain() {
        let mut m = seeded(1);
        let defender = mage();
        m.register(FnListener::boxed(1, |_, _| true)).unwrap();

        let msg = GameMessage::new(m.chain(), "DAMAGE")
            .with_receiver(defender)
            .with_value(5);
        m.accept(msg);
        m.execute_all().unwrap();

        assert!(m.is_empty());
        assert_eq!(m.chain().history_len(), 0);
        assert!(!m.chain().is_reacted(ListenerId::new(1)));
    }

    #[test]
    fn test_check_body_mismatch_is_noop() {
        let mut m = seeded(1);
        let defender = mage();

        let mut msg = GameMessage::new(m.chain(), "DAMAGE")
            .with_receiver(defender.clone())
            .with_value(10)
            .with_phase(Phase::Main);
        msg.check_body = Some(crate::MsgId(9999));
        m.chain_mut().accept(msg);

        assert!(!m.execute_one().unwrap());
        assert_eq!(hp(&defender), 100);
        assert_eq!(m.chain().history_len(), 0);
    }

    #[test]
    fn test_ignored_message_resolves_without_dispatch() {
        let mut m = seeded(1);
        let defender = mage();

        let mut msg = GameMessage::new(m.chain(), "DAMAGE")
            .with_receiver(defender.clone())
            .with_value(10);
        msg.add_extra(ExtraTag::Ignore, true).unwrap();
        m.accept(msg);
        m.execute_all().unwrap();

        assert_eq!(hp(&defender), 100);
    }

    #[test]
    fn test_manager_reset() {
        let mut m = seeded(1);
        m.register(FnListener::boxed(1, |_, _| true)).unwrap();
        m.handler_mut()
            .register_type("POISON", cont_handler(), Phase::Main)
            .unwrap();

        m.reset();

        assert_eq!(m.listener_count(), 0);
        assert!(!m.handler().is_registered_type("POISON"));
        // The base ruleset survives the reset.
        assert!(m.handler().is_registered_type("ATTACK"));
    }

    #[test]
    fn test_shared_base_sessions_stay_isolated() {
        let base = Rc::new(Handler::base_ruleset());
        let mut m1 = MessageManager::new(base.clone());
        let mut m2 = MessageManager::new(base);

        // Session 1 neutralizes DAMAGE locally.
        m1.handler_mut()
            .replace_type("DAMAGE", cont_handler(), Phase::Main)
            .unwrap();

        let victim1 = mage();
        let msg = GameMessage::new(m1.chain(), "DAMAGE")
            .with_receiver(victim1.clone())
            .with_value(10);
        m1.accept(msg);
        m1.execute_all().unwrap();
        assert_eq!(hp(&victim1), 100);

        // Session 2 still runs the base behavior.
        let victim2 = mage();
        let msg = GameMessage::new(m2.chain(), "DAMAGE")
            .with_receiver(victim2.clone())
            .with_value(10);
        m2.accept(msg);
        m2.execute_all().unwrap();
        assert_eq!(hp(&victim2), 90);
    }

    #[test]
    fn test_chain_variable_fuels_one_shot_modifier() {
        let mut m = seeded(1);
        let attacker = warrior();
        let defender = mage();

        // On ATTACK PRE the attacker stashes three "war cry" stacks; on
        // DAMAGE PRE a one-shot modifier consumes them, doubling per stack.
        let a = attacker.clone();
        let stash = FnListener::boxed(1, move |ctx, msg| {
            if msg.kind.as_str() == "ATTACK"
                && msg.phase == Phase::Pre
                && msg.sender.as_ref().is_some_and(|s| same_entity(s, &a))
            {
                ctx.chain.vadd("war_cry", "stacks", 3i64);
                return true;
            }
            false
        });
        let b = attacker.clone();
        let consume = FnListener::boxed(2, move |ctx, msg| {
            if msg.kind.as_str() == "DAMAGE"
                && msg.phase == Phase::Pre
                && msg.sender.as_ref().is_some_and(|s| same_entity(s, &b))
            {
                let burst: ModifierFn = Rc::new(|ctx, msg, _arg| {
                    let raw = msg.get_value();
                    let stacks = ctx
                        .chain
                        .vpop("war_cry", "stacks")
                        .and_then(|v| v.as_int())
                        .unwrap_or(0);
                    let mut value = raw;
                    for _ in 0..stacks {
                        value *= 2;
                    }
                    msg.value = MsgValue::Lit(value);
                    ctx.handler.unregister_modifier("war_cry_burst");
                    Ok(ModifierResult::applied(raw, value))
                });
                ctx.handler.register_modifier("war_cry_burst", burst);
                msg.modify(
                    ModifierKey::Custom("war_cry_burst".into()),
                    ModifierArg::None,
                );
                return true;
            }
            false
        });
        m.register(stash).unwrap();
        m.register(consume).unwrap();

        let msg = GameMessage::new(m.chain(), "ATTACK")
            .with_sender(attacker)
            .with_receiver(defender.clone())
            .with_value(10);
        m.accept(msg);
        m.execute_all().unwrap();

        // 10 damage doubled three times: 80.
        assert_eq!(hp(&defender), 20);
        assert!(!m.handler().is_registered_modifier("war_cry_burst"));
    }

    #[test]
    fn test_team_scoped_heal() {
        let mut m = seeded(1);
        let attacker = warrior();
        let teammate = TestCharacter::new("scout").with_team(1).into_handle();
        let outsider = mage();
        let healer = TestCharacter::new("cleric").with_team(1).into_handle();

        let owner = healer.clone();
        let heal_team = FnListener::boxed(1, move |ctx, msg| {
            if msg.kind.as_str() == "DAMAGE" && msg.phase == Phase::Post {
                if let Some(receiver) = msg.receiver.clone() {
                    if receiver.borrow().team() == owner.borrow().team() {
                        let heal = GameMessage::new(ctx.chain, "HEAL")
                            .with_sender(owner.clone())
                            .with_receiver(receiver)
                            .with_value(2);
                        ctx.chain.accept(heal);
                        return true;
                    }
                }
            }
            false
        });
        m.register(heal_team).unwrap();

        let msg = GameMessage::new(m.chain(), "DAMAGE")
            .with_sender(attacker.clone())
            .with_receiver(teammate.clone())
            .with_value(10);
        m.accept(msg);
        m.execute_all().unwrap();

        let msg = GameMessage::new(m.chain(), "DAMAGE")
            .with_sender(attacker)
            .with_receiver(outsider.clone())
            .with_value(10);
        m.accept(msg);
        m.execute_all().unwrap();

        assert_eq!(hp(&teammate), 92); // healed
        assert_eq!(hp(&outsider), 90); // not healed
    }
}
