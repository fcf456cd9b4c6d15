//! Users and credentials, independent of queue logic.

mod directory;
mod models;
mod password;

pub use directory::UserDirectory;
pub use models::{CreateUserOptions, CreateUserResult, User};
pub use password::{hash_password, verify_password, BcryptPasswordHasher, PasswordHasher};
