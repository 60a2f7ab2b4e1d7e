mod generation;
mod healing;
mod patterns;
mod schema;

pub use generation::*;
pub use healing::*;
pub use patterns::*;
pub use schema::*;
