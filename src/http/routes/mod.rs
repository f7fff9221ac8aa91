pub mod access;
pub mod auth;
pub mod health;
pub mod playback;
pub mod server;
pub mod sessions;
