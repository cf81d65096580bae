pub mod locations;
pub mod memory;
pub mod postgres;

pub use locations::{LocationCatalog, LocationIndex};
pub use memory::{MemorySink, MemoryStore, SharedStore};
pub use postgres::PostgresSink;
