pub mod audit;
pub mod errors;
pub mod fixes;
