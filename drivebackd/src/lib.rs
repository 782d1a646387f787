pub mod control;
pub mod daemon;
pub mod store;
pub mod sync;
