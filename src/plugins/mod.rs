pub mod traits;
pub mod manager;
pub mod parsers;

pub use manager::ParserRegistry;
pub use traits::CategoryParser;
