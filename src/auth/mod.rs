//! Authentication and authorisation.
//!
//! [`credentials`] turns raw SSH keys and HTTP Basic credentials into a
//! [`access::Principal`]; [`access`] decides what that principal may do to a
//! repository.

pub mod access;
pub mod credentials;
pub mod password;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Hash(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),
}
