pub mod codec;
pub mod files;
pub mod source;
pub mod store;
pub mod types;
