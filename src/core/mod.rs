pub mod codec;
pub mod envelope;
pub mod error;
pub mod queue;
