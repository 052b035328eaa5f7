pub mod core;
pub mod services;
pub mod utils;
pub mod web;
