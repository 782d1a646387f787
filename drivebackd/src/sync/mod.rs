pub mod backoff;
pub mod engine;
pub mod fanout;
pub mod ledger;
pub mod paths;
pub mod policy;
pub mod scheduler;
pub mod scratch;
pub mod selection;
pub mod transfer;
pub mod walker;

#[cfg(test)]
pub(crate) mod testing;
