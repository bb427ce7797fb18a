//! Credential checks consumed by server sessions.
//!
//! Sessions only see the [`AuthService`] trait. [`MemoryAuthService`] is a
//! process-local implementation for tests and the reference server; a real
//! deployment plugs in its own account store.

use std::fmt::Write as _;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Outcome of a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    /// Whether the credentials were accepted.
    pub accepted: bool,
    /// Message relayed to the client.
    pub message: String,
    /// Session token; empty when rejected.
    pub token: String,
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// Whether the account was created.
    pub accepted: bool,
    /// Message relayed to the client.
    pub message: String,
}

/// The auth backend could not produce a verdict at all.
#[derive(Debug, thiserror::Error)]
pub enum AuthServiceError {
    /// The backing store is unreachable or failed.
    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

/// Account verification used by the server's auth gate.
///
/// A rejected login is an `Ok` outcome with `accepted == false`; `Err` is
/// reserved for the service itself failing.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Check credentials and open a session on success.
    async fn login(&self, username: &str, password: &str)
    -> Result<LoginOutcome, AuthServiceError>;

    /// Create a new account.
    async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<RegisterOutcome, AuthServiceError>;
}

struct Account {
    password: String,
    failed_attempts: u32,
}

/// In-memory [`AuthService`]. Passwords are held in plain text, so this is
/// only suitable for tests and local runs.
#[derive(Default)]
pub struct MemoryAuthService {
    accounts: DashMap<String, Account>,
    sessions: DashMap<String, String>,
}

impl MemoryAuthService {
    /// An empty account store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account directly, replacing any existing one.
    pub fn with_user(self, username: &str, password: &str) -> Self {
        self.accounts.insert(
            username.to_string(),
            Account {
                password: password.to_string(),
                failed_attempts: 0,
            },
        );
        self
    }

    /// The account a session token belongs to, if the token was issued here.
    pub fn session_user(&self, token: &str) -> Option<String> {
        self.sessions.get(token).map(|user| user.value().clone())
    }

    /// Number of accounts.
    pub fn user_count(&self) -> usize {
        self.accounts.len()
    }
}

fn new_token() -> String {
    let bytes: [u8; 32] = rand::random();
    let mut token = String::with_capacity(64);
    for b in bytes {
        let _ = write!(token, "{b:02x}");
    }
    token
}

fn rejected(message: impl Into<String>) -> LoginOutcome {
    LoginOutcome {
        accepted: false,
        message: message.into(),
        token: String::new(),
    }
}

#[async_trait]
impl AuthService for MemoryAuthService {
    async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<LoginOutcome, AuthServiceError> {
        let username = username.trim();
        let Some(mut account) = self.accounts.get_mut(username) else {
            return Ok(rejected("Invalid credentials."));
        };

        if account.password != password {
            account.failed_attempts += 1;
            return Ok(rejected(format!(
                "Invalid credentials. Failed attempts: {}.",
                account.failed_attempts
            )));
        }

        account.failed_attempts = 0;
        drop(account);

        let token = new_token();
        self.sessions.insert(token.clone(), username.to_string());
        Ok(LoginOutcome {
            accepted: true,
            message: "OK".to_string(),
            token,
        })
    }

    async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<RegisterOutcome, AuthServiceError> {
        let username = username.trim();
        if username.is_empty() {
            return Ok(RegisterOutcome {
                accepted: false,
                message: "Username must not be empty.".to_string(),
            });
        }
        if password.is_empty() {
            return Ok(RegisterOutcome {
                accepted: false,
                message: "Password must not be empty.".to_string(),
            });
        }

        match self.accounts.entry(username.to_string()) {
            Entry::Occupied(_) => Ok(RegisterOutcome {
                accepted: false,
                message: "Username already exists.".to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Account {
                    password: password.to_string(),
                    failed_attempts: 0,
                });
                tracing::info!("Registered user '{username}'");
                Ok(RegisterOutcome {
                    accepted: true,
                    message: "Created".to_string(),
                })
            }
        }
    }
}
