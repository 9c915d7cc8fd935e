pub mod analyzer;
pub mod ast;
pub mod config;
pub mod datastore;
pub mod engine;
pub mod schema;
