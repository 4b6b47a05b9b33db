pub mod governor;
pub mod inference;
pub mod ledger;
pub mod memory_queue;
pub mod notifications;
pub mod queue;
pub mod results;
pub mod storage;
