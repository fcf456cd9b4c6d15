use crate::error::Result;
use crate::user::{hash_password, verify_password, CreateUserOptions, CreateUserResult, User};

use super::Store;

impl Store {
    #[tracing::instrument(skip_all, fields(username = %options.username))]
    pub async fn create_user(&self, options: CreateUserOptions) -> Result<CreateUserResult> {
        let password_hash = self.hash_user_password(&options).await?;
        self.with_users(move |mut users| {
            Box::pin(async move { users.create(options, password_hash).await })
        })
        .await
    }

    pub(super) async fn hash_user_password(&self, options: &CreateUserOptions) -> Result<Option<String>> {
        match &options.password {
            Some(password) => Ok(Some(
                hash_password(self.inner.hasher.clone(), password.clone()).await?,
            )),
            None => Ok(None),
        }
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<User> {
        let username = username.to_string();
        self.with_users(move |mut users| {
            Box::pin(async move { users.get_by_username(&username).await })
        })
        .await
    }

    pub async fn get_user_by_access_key_id(&self, access_key_id: &str) -> Result<User> {
        let access_key_id = access_key_id.to_string();
        self.with_users(move |mut users| {
            Box::pin(async move { users.get_by_access_key_id(&access_key_id).await })
        })
        .await
    }

    pub async fn get_users(&self) -> Result<Vec<User>> {
        self.with_users(|mut users| Box::pin(async move { users.list().await }))
            .await
    }

    /// Check a password against the stored hash. The hash is never returned.
    /// Users without a password never match.
    #[tracing::instrument(skip_all, fields(username = %username))]
    pub async fn verify_password(&self, username: &str, password: &str) -> Result<bool> {
        let username = username.to_string();
        let stored = self
            .with_users(move |mut users| {
                Box::pin(async move { users.password_hash(&username).await })
            })
            .await?;
        match stored {
            Some(hash) => verify_password(self.inner.hasher.clone(), password.to_string(), hash).await,
            None => Ok(false),
        }
    }
}
