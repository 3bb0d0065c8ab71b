mod entry;
mod host_pattern;
mod database;
mod loader;
mod manager;
mod cache;
mod rdns;

pub use entry::{UserEntry, UserEntryType, UserEntryResult};
pub use host_pattern::{like_match, pattern_type, PatternType};
pub use database::{UserDatabase, FindEntry};
pub use loader::{UserLoader, SqlUserLoader, FileUserLoader, parse_users_json};
pub use manager::UserManager;
pub use cache::UserCache;
pub use rdns::{reverse_lookup, reverse_lookup_blocking};
