pub mod config;
pub mod db;
pub mod environment;
pub mod logging;
pub mod matching;

pub const TARGET_DB: &str = "db_query";
pub const TARGET_MATCH: &str = "match";
