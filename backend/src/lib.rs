pub mod config;
pub mod error;
pub mod inference;
pub mod model;
pub mod routes;
pub mod storage;
