pub mod collaborators;
pub mod parser;
pub mod runner;
pub mod sensor;

#[cfg(test)]
pub use collaborators::SimulatedBackend;
pub use parser::Scenario;
pub use runner::Runner;
#[cfg(test)]
pub use sensor::SimulatedSensor;
