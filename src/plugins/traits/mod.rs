pub mod parser;

pub use parser::CategoryParser;
