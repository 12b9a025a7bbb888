pub mod controller;
pub mod runner;

pub use controller::*;
pub use runner::*;
