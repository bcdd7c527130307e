pub mod auth;
pub mod commands;
pub mod devices;
pub mod history;
pub mod pairing;
