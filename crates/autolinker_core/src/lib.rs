pub mod cache;
pub mod catalog;
pub mod config;
pub mod fetch;
pub mod linker;
pub mod patterns;
pub mod rewrite;
pub mod runtime;
pub mod trigger;
pub mod variants;
