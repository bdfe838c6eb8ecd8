pub mod auth;
mod config;
mod error;
pub mod helpers;
mod types;

pub use auth::AuthPolicy;
pub use config::*;
pub use error::FishlerError;
pub use types::*;
