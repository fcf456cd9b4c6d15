use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::storage::Transaction;

use super::models::{CreateUserOptions, CreateUserResult, User};

/// User records inside one storage transaction.
///
/// Usernames and access key ids are two independent uniqueness domains.
/// Passwords arrive already hashed: hashing happens before the transaction
/// opens so it never holds a connection.
pub struct UserDirectory<'a> {
    tx: &'a mut dyn Transaction,
}

impl<'a> UserDirectory<'a> {
    pub fn new(tx: &'a mut dyn Transaction) -> Self {
        Self { tx }
    }

    /// Insert a user. `password_hash` replaces `options.password`, which is ignored.
    pub async fn create(
        &mut self,
        options: CreateUserOptions,
        password_hash: Option<String>,
    ) -> Result<CreateUserResult> {
        if self.tx.find_user_by_username(&options.username).await?.is_some() {
            return Err(BrokerError::UsernameAlreadyExists(options.username));
        }
        if let Some(key) = &options.access_key_id {
            if self.tx.find_user_by_access_key_id(key).await?.is_some() {
                return Err(BrokerError::AccessKeyIdAlreadyExists(key.clone()));
            }
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            username: options.username,
            password_hash,
            access_key_id: options.access_key_id,
            secret_access_key: options.secret_access_key,
        };
        if let Err(e) = self.tx.insert_user(&user).await {
            return Err(if e.is_conflict() {
                BrokerError::UsernameAlreadyExists(user.username)
            } else {
                e.into()
            });
        }

        tracing::info!(username = %user.username, user_id = %user.id, "User created");
        Ok(CreateUserResult { id: user.id })
    }

    pub async fn get_by_username(&mut self, username: &str) -> Result<User> {
        self.tx
            .find_user_by_username(username)
            .await?
            .ok_or_else(|| BrokerError::UserNotFound(username.to_string()))
    }

    pub async fn get_by_access_key_id(&mut self, access_key_id: &str) -> Result<User> {
        self.tx
            .find_user_by_access_key_id(access_key_id)
            .await?
            .ok_or_else(|| BrokerError::UserNotFound(access_key_id.to_string()))
    }

    pub async fn list(&mut self) -> Result<Vec<User>> {
        let mut users = self.tx.list_users().await?;
        users.sort_by_cached_key(|u| u.username.to_lowercase());
        Ok(users)
    }

    /// Stored password hash of `username`, `None` for users without a password.
    pub async fn password_hash(&mut self, username: &str) -> Result<Option<String>> {
        Ok(self.get_by_username(username).await?.password_hash)
    }
}
