pub mod chat;
pub mod errors;
pub mod events;
pub mod generation;
pub mod models;
pub mod sessions;
