pub mod cache;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod interval;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
