pub mod config;
pub mod error;
pub mod security;
pub mod types;

pub use config::Config;
pub use error::CommonError;
pub use security::{AeadCipher, SecretCipher, SecretString};
pub use types::*;
