pub mod engine;
pub mod warmup;

pub use engine::Scheduler;
pub use warmup::warm_up_short_term;
