pub mod descriptor;
pub mod payload;
pub mod pipeline;
pub mod transport;
