pub mod agent;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod models;
pub mod routes;
pub mod service;
pub mod tree;
