pub mod dispatch_state;
pub mod fairness;
pub mod matching;
pub mod router;
pub mod scheduler;
pub mod scoring;
pub mod shard;
pub mod solver;
