// Core modules (used by services)
pub mod clients;
pub mod db;
pub mod models;
pub mod utils;
