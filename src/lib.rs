pub mod config;
pub mod error;
pub mod gateway;
pub mod link;
pub mod phone;

pub use config::Config;
pub use error::AppError;
