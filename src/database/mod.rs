pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;
pub mod warehouse;

pub use self::memory::MemoryWarehouse;
pub use self::postgres::PostgresWarehouse;
pub use self::warehouse::{SharedWarehouse, Warehouse};
