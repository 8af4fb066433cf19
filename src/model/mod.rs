pub mod aggregate;
pub mod entity;
pub mod kind;
pub mod seed;

pub use aggregate::{AggregateRoot, SyncMode, Template};
pub use entity::{Entity, EntityPayload, MemberSet, PayloadScope, PersistStatus, Slot, SlotValue};
pub use kind::{EntityKind, LineCategory};
pub use seed::{AggregateSeed, EntitySeed};
