pub mod matching;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod utils;
