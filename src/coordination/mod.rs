//! Role coordination for a pool of identical workers sharing one broker.
//!
//! Exactly one worker at a time holds the generator lease and produces
//! messages; every other worker is a listener consuming them.  A watcher on
//! every worker prunes dead listeners and, when the lease lapses, promotes a
//! live listener.  All cross-worker state lives in the broker so that workers
//! cooperate without any other shared state.

pub mod coordinator;
pub mod generator;
pub mod listener;
pub mod node;
pub mod probe;
pub mod timers;
pub mod watcher;
