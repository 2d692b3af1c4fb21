pub mod cli;
pub mod error;
pub mod node;
pub mod runtime;
pub mod settings;
pub mod transport;
