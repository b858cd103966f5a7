pub mod entity;
pub mod episode;
pub mod fact;

pub use entity::{Entity, EntityKind, MatchKind, Resolution};
pub use episode::Episode;
pub use fact::{BeliefChanges, Fact, FactInput, NewFact, ScoredFact};
