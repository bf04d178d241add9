pub mod correlate;
pub mod filesystem;
pub mod reconcile;
