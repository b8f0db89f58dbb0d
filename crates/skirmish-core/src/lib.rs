//! Skirmish Core - Phase-aware event dispatch for turn-based combat
//!
//! This crate provides the dispatch engine that drives turn-based ability
//! resolution:
//! - Typed game messages with a PRE/MAIN/POST phase-splitting protocol
//! - A per-session message chain (queue, history, reacted ledger, scoped
//!   variables)
//! - Layered handler registries with built-in ATTACK/DAMAGE/HEAL rules
//! - An ordered, single-use modifier pipeline with audit broadcasts
//! - A session manager that drains the queue under a runaway-chain watchdog
//!
//! ## Boundary contracts
//!
//! Characters, skills and items live outside this crate; the engine sees
//! them through the [`CombatEntity`], [`Registrable`] and [`Listener`]
//! capabilities. Dispatch is strictly sequential and single-threaded: embed
//! one [`MessageManager`] per game session and protect it with a single
//! exclusive lock if the host is multi-threaded.

mod chain;
mod entity;
mod error;
mod handler;
mod identity;
mod manager;
mod message;
mod processor;
mod rng;
mod value;

#[cfg(test)]
mod testkit;

pub use chain::MessageChain;
pub use entity::{
    same_entity, Attribute, CombatEntity, EntityHandle, EntityKind, Listener, Registrable,
};
pub use error::{Error, Result};
pub use handler::{
    EngineCtx, Handler, HandlerFn, HandlerReply, ModifierFn, ModifierResult, Outcome,
};
pub use identity::{ChainId, EntityId, ListenerId, MsgId, MsgType};
pub use manager::{Broadcast, EngineConfig, MessageManager};
pub use message::{
    ExtraTag, GameMessage, ModifierArg, ModifierKey, MsgValue, Phase, ValueFn,
};
pub use processor::MessageProcessor;
pub use rng::GameRng;
pub use value::{Value, ValueType};
