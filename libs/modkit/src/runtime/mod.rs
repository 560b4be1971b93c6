mod runner;
mod signals;

pub use runner::{run, RunOptions, ShutdownOptions};
pub use signals::wait_for_signal;

#[cfg(test)]
mod tests;
