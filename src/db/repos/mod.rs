pub mod generation;
pub mod healing;
pub mod patterns;
pub mod schema;
