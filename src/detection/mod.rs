pub mod cache;
pub mod detector;
pub mod types;
