//! API tokens. Only the SHA-256 digest of a token is ever stored.

use std::sync::Arc;

use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::db::queries::AccessTokenEntry;
use crate::db::Database;
use crate::errors::DatabaseError;

const TOKEN_PREFIX: &str = "pf_";

/// Hex SHA-256 of a plaintext token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// A freshly issued token. The plaintext is shown once.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub id: i64,
    pub username: String,
    pub token: String,
}

#[derive(Clone)]
pub struct TokenService {
    db: Arc<Database>,
}

impl TokenService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn issue(&self, username: &str, name: &str) -> Result<IssuedToken, DatabaseError> {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = format!("{}{}", TOKEN_PREFIX, hex::encode(bytes));
        let id = self.db.insert_access_token(username, name, &hash_token(&token))?;
        info!(username, name, id, "issued access token");
        Ok(IssuedToken {
            id,
            username: username.to_string(),
            token,
        })
    }

    /// Username owning `token`, if it is valid.
    pub fn verify(&self, token: &str) -> Result<Option<String>, DatabaseError> {
        if !token.starts_with(TOKEN_PREFIX) {
            return Ok(None);
        }
        self.db.find_token_user(&hash_token(token))
    }

    pub fn list(&self, username: &str) -> Result<Vec<AccessTokenEntry>, DatabaseError> {
        self.db.list_access_tokens(username)
    }

    pub fn revoke(&self, id: i64) -> Result<bool, DatabaseError> {
        self.db.delete_access_token(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let tokens = TokenService::new(db);

        let issued = tokens.issue("alice", "laptop").unwrap();
        assert!(issued.token.starts_with("pf_"));
        assert_eq!(issued.token.len(), 3 + 40);
        assert_eq!(tokens.verify(&issued.token).unwrap().as_deref(), Some("alice"));
        assert_eq!(tokens.verify("pf_deadbeef").unwrap(), None);
        assert_eq!(tokens.verify("not-a-token").unwrap(), None);

        let listed = tokens.list("alice").unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].last_used_at.is_some());

        assert!(tokens.revoke(issued.id).unwrap());
        assert_eq!(tokens.verify(&issued.token).unwrap(), None);
    }

    #[test]
    fn test_hash_is_stable_hex() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
