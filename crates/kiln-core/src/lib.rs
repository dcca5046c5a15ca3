pub mod config;
pub mod debug;
pub mod discovery;
pub mod fqbn;
pub mod index;
pub mod instance;
pub mod operation;
pub mod process;
pub mod recipe;
pub mod sketch;

mod engine;
mod error;

#[cfg(test)]
mod tests;

pub use engine::KilnCore;
pub use error::{Error, Result};

pub use kiln_types::*;
