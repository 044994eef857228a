//! Database access: schema initialization, row models, advisory locks

pub mod init;
pub mod lock;
pub mod models;

pub use init::init_database;
pub use lock::{acquire_lock, release_lock};
