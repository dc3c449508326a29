//! Strata transformer block: the unit of computation a server hosts.

mod backward;
pub mod block;
pub mod layers;
pub mod loader;

pub use block::TransformerBlock;
pub use loader::{load_block, SafeTensorsLoader};
