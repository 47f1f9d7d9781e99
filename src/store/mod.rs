pub mod cache;
pub mod codec;
pub mod delta;
pub mod lock;
pub mod mapping;
pub mod schema;
pub mod segment;
