pub mod error;
pub mod user_agents;

pub use error::{AppError, Result};
