pub mod daemon;
pub mod query;
