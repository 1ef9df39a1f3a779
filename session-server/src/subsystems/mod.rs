pub mod cleanup;
pub mod persister;
pub mod schema;
pub mod summarize;
pub mod summary_worker;
