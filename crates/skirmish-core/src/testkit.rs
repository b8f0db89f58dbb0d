//! Shared test fixtures: a clamping combat character and closure listeners
//!
//! The engine itself ships no character model; these minimal implementations
//! of the boundary traits exist only for the test suites.

use crate::entity::{same_entity, Attribute, CombatEntity, EntityHandle, Listener};
use crate::handler::EngineCtx;
use crate::identity::ListenerId;
use crate::message::{ExtraTag, GameMessage, Phase};
use std::cell::RefCell;
use std::rc::Rc;

/// A concrete combat entity with original-flavored default stats
pub(crate) struct TestCharacter {
    pub name: String,
    pub attack: i64,
    pub defense: i64,
    pub critical: i64,
    pub critical_damage: i64,
    pub evasion: i64,
    pub team: i64,
    pub max_hp: i64,
    pub current_hp: i64,
}

impl TestCharacter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attack: 10,
            defense: 10,
            critical: 5,
            critical_damage: 200,
            evasion: 5,
            team: 0,
            max_hp: 100,
            current_hp: 100,
        }
    }

    pub fn with_attack(mut self, v: i64) -> Self {
        self.attack = v;
        self
    }

    pub fn with_defense(mut self, v: i64) -> Self {
        self.defense = v;
        self
    }

    pub fn with_critical(mut self, v: i64) -> Self {
        self.critical = v;
        self
    }

    pub fn with_evasion(mut self, v: i64) -> Self {
        self.evasion = v;
        self
    }

    pub fn with_team(mut self, v: i64) -> Self {
        self.team = v;
        self
    }

    pub fn with_hp(mut self, v: i64) -> Self {
        self.max_hp = v;
        self.current_hp = v;
        self
    }

    pub fn into_handle(self) -> EntityHandle {
        Rc::new(RefCell::new(self))
    }
}

impl CombatEntity for TestCharacter {
    fn name(&self) -> &str {
        &self.name
    }

    fn attack(&self) -> i64 {
        self.attack
    }

    fn defense(&self) -> i64 {
        self.defense
    }

    fn critical(&self) -> i64 {
        self.critical
    }

    fn critical_damage(&self) -> i64 {
        self.critical_damage
    }

    fn evasion(&self) -> i64 {
        self.evasion
    }

    fn team(&self) -> i64 {
        self.team
    }

    fn current_hp(&self) -> i64 {
        self.current_hp
    }

    fn change_attribute(&mut self, attr: Attribute, delta: i64) {
        match attr {
            Attribute::Attack => self.attack += delta,
            Attribute::Defense => self.defense += delta,
            Attribute::Critical => self.critical += delta,
            Attribute::CriticalDamage => self.critical_damage += delta,
            Attribute::Evasion => self.evasion += delta,
            Attribute::Team => self.team += delta,
            Attribute::MaxHp => {
                self.max_hp += delta;
                self.current_hp = self.current_hp.min(self.max_hp);
            }
            Attribute::CurrentHp => {
                self.current_hp = (self.current_hp + delta).clamp(0, self.max_hp);
            }
        }
    }
}

/// Read an entity's current hp through its handle
pub(crate) fn hp(handle: &EntityHandle) -> i64 {
    handle.borrow().current_hp()
}

type UpdateFn = Box<dyn FnMut(&mut EngineCtx<'_>, &mut GameMessage) -> bool>;

/// A listener driven by a closure
pub(crate) struct FnListener {
    id: ListenerId,
    update: UpdateFn,
}

impl FnListener {
    pub fn boxed(
        id: u64,
        f: impl FnMut(&mut EngineCtx<'_>, &mut GameMessage) -> bool + 'static,
    ) -> Box<Self> {
        Box::new(Self {
            id: ListenerId::new(id),
            update: Box::new(f),
        })
    }
}

impl Listener for FnListener {
    fn listener_id(&self) -> ListenerId {
        self.id
    }

    fn update(&mut self, ctx: &mut EngineCtx<'_>, msg: &mut GameMessage) -> bool {
        (self.update)(ctx, msg)
    }
}

/// Thorn-armor passive: reflects 30% of incoming damage, deferred
pub(crate) fn thorn_listener(id: u64, owner: EntityHandle) -> Box<FnListener> {
    FnListener::boxed(id, move |ctx, msg| {
        let mine = msg
            .receiver
            .as_ref()
            .is_some_and(|r| same_entity(r, &owner));
        if msg.kind.as_str() == "DAMAGE"
            && msg.phase == Phase::Pre
            && mine
            && owner.borrow().current_hp() > 0
        {
            let reflect = msg.get_value() * 30 / 100;
            if reflect > 0 {
                let mut back = GameMessage::new(ctx.chain, "DAMAGE")
                    .with_sender(owner.clone())
                    .with_value(reflect);
                back.receiver = msg.sender.clone();
                back.add_extra(ExtraTag::DamageType, "reflected").unwrap();
                ctx.chain.accept_deferred(back);
                return true;
            }
        }
        false
    })
}

/// Vitality passive: heals 1 hp after every damaging hit, immediate
pub(crate) fn heal_listener(id: u64, owner: EntityHandle) -> Box<FnListener> {
    FnListener::boxed(id, move |ctx, msg| {
        let mine = msg
            .receiver
            .as_ref()
            .is_some_and(|r| same_entity(r, &owner));
        if msg.kind.as_str() == "DAMAGE"
            && msg.phase == Phase::Post
            && mine
            && owner.borrow().current_hp() > 0
            && msg.get_value() > 0
        {
            let heal = GameMessage::new(ctx.chain, "HEAL")
                .with_sender(owner.clone())
                .with_receiver(owner.clone())
                .with_value(1);
            ctx.chain.accept(heal);
            return true;
        }
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_character_clamps_hp() {
        let mut c = TestCharacter::new("dummy");
        c.change_attribute(Attribute::CurrentHp, -1000);
        assert_eq!(c.current_hp, 0);
        c.change_attribute(Attribute::CurrentHp, 1000);
        assert_eq!(c.current_hp, 100);

        // Lowering the cap pulls current hp down with it.
        c.change_attribute(Attribute::MaxHp, -40);
        assert_eq!(c.max_hp, 60);
        assert_eq!(c.current_hp, 60);
    }
}
