pub mod selector;

pub use selector::{SelectorParser, SelectorProfile};
