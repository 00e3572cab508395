// Re-export the Database struct and other public items
pub mod core;
pub mod grants;
pub mod registry;
mod schema;

// Re-export Database and essential traits
pub use self::core::Database;
pub use self::core::DbLockErrorExt;
pub use self::grants::{GrantRow, TierCount};
pub use self::registry::FoundationRow;
