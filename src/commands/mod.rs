pub mod entities;
pub mod import;
pub mod mappings;
