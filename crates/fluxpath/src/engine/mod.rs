pub mod runner;

pub use runner::DpEngine;
