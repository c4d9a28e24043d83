pub mod memory;
pub mod pg;
pub mod players_import;
pub mod store;

pub use memory::MemoryStore;
pub use pg::PgStore;
pub use players_import::import_players;
pub use store::TotdStore;
