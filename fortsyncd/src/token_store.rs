use keyring::Entry;
use thiserror::Error;

const SERVICE_NAME: &str = "com.fortsync.daemon";
const TOKEN_KEY: &str = "api_token";
pub const TOKEN_ENV: &str = "FORTSYNC_API_TOKEN";

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Where the daemon keeps the API token between runs. The engine itself never
/// sees this type; the daemon resolves a token once at bootstrap and hands
/// the string to the client.
pub struct TokenStore {
    entry: Entry,
}

impl TokenStore {
    pub fn new() -> Result<Self, TokenStoreError> {
        Ok(Self {
            entry: Entry::new(SERVICE_NAME, TOKEN_KEY)?,
        })
    }

    /// Environment override first, stored secret second.
    pub fn load(&self) -> Result<Option<String>, TokenStoreError> {
        if let Some(token) = env_token(std::env::var(TOKEN_ENV).ok()) {
            return Ok(Some(token));
        }
        match self.entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, token: &str) -> Result<(), TokenStoreError> {
        Ok(self.entry.set_password(token)?)
    }

    pub fn forget(&self) -> Result<(), TokenStoreError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn env_token(value: Option<String>) -> Option<String> {
    value.filter(|token| !token.trim().is_empty())
}
