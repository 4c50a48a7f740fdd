//! different utility modules used throughout the project
/// logger initialisation and pretty-printed fit summaries
pub mod logger;
