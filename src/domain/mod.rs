pub mod events;
pub mod geo;
pub mod node;
pub mod parser;
pub mod reconcile;
pub mod registry;
