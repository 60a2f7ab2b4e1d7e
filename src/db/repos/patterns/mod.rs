pub mod error_patterns;
pub mod validation_patterns;
