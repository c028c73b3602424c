//! Anti-forgery tokens: `<nonce>.<hex hmac-sha256(secret, nonce)>`.

use hmac::{Hmac, Mac};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<sha2::Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not of the form <nonce>.<mac>")]
    Malformed,
    #[error("token mac mismatch")]
    MacMismatch,
    #[error("unusable hmac key")]
    Key,
}

#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer").finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    pub fn issue(&self) -> Result<String, TokenError> {
        self.issue_with_nonce(&Uuid::new_v4().simple().to_string())
    }

    pub fn issue_with_nonce(&self, nonce: &str) -> Result<String, TokenError> {
        let mut mac = self.mac()?;
        mac.update(nonce.as_bytes());
        Ok(format!("{nonce}.{}", hex::encode(mac.finalize().into_bytes())))
    }

    pub fn verify(&self, token: &str) -> Result<(), TokenError> {
        let (nonce, tag) = token.split_once('.').ok_or(TokenError::Malformed)?;
        if nonce.is_empty() {
            return Err(TokenError::Malformed);
        }
        let tag = hex::decode(tag).map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(nonce.as_bytes());
        mac.verify_slice(&tag).map_err(|_| TokenError::MacMismatch)
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Key)
    }
}
