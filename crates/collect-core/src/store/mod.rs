pub mod deletion;
pub mod registry;
pub mod schema;
