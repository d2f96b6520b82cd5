pub mod config;
pub mod errors;
pub mod handler;
pub mod invoker;
pub mod model;
pub mod pipeline;
pub mod plan;
pub mod repository;
pub mod scene;
pub mod task;
pub mod timer;

#[cfg(test)]
pub mod testing;
