//! Rule matching and enforcement.

pub mod cache;
pub mod criteria;
pub mod engine;

pub use cache::RuleCache;
pub use engine::RulesEngine;
