pub mod evaluation_service;
pub mod models;
pub mod state;
