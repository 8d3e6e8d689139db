//! Authentication plugin
//!
//! Checks CONNECT credentials against a static user list. Passwords are
//! given either in plaintext or as argon2 PHC strings.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::ConfigError;
use crate::hooks::{ClientInfo, HookResult, Hooks, Plugin, PluginRegistry, Verdict};

pub const NAME: &str = "auth";

/// Settings under `plugins.config.auth`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Admit clients that send no username
    pub allow_anonymous: bool,
    pub users: Vec<UserConfig>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Password (plaintext) - use password_hash for production
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
}

enum Credential {
    Plain(String),
    /// Validated PHC string
    Hash(String),
}

fn invalid(reason: String) -> ConfigError {
    ConfigError::Plugin {
        name: NAME.to_string(),
        reason,
    }
}

/// Static credential check
pub struct AuthPlugin {
    allow_anonymous: bool,
    users: HashMap<String, Credential>,
}

impl AuthPlugin {
    pub fn new(settings: AuthSettings) -> Result<Self, ConfigError> {
        let mut users = HashMap::with_capacity(settings.users.len());
        for user in settings.users {
            let credential = match (user.password, user.password_hash) {
                (None, None) => {
                    return Err(invalid(format!(
                        "user '{}' must have either 'password' or 'password_hash'",
                        user.username
                    )))
                }
                (Some(_), Some(_)) => {
                    return Err(invalid(format!(
                        "user '{}' cannot have both 'password' and 'password_hash'",
                        user.username
                    )))
                }
                (Some(password), None) if password.is_empty() => {
                    return Err(invalid(format!("user '{}' has empty password", user.username)))
                }
                (Some(password), None) => Credential::Plain(password),
                (None, Some(hash)) => {
                    if !hash.starts_with("$argon2") || PasswordHash::new(&hash).is_err() {
                        return Err(invalid(format!(
                            "user '{}' has invalid password_hash (must be argon2 PHC format)",
                            user.username
                        )));
                    }
                    Credential::Hash(hash)
                }
            };
            if users.insert(user.username.clone(), credential).is_some() {
                return Err(invalid(format!("user '{}' defined twice", user.username)));
            }
        }
        Ok(Self {
            allow_anonymous: settings.allow_anonymous,
            users,
        })
    }

    fn verify(&self, username: &str, password: &[u8]) -> bool {
        match self.users.get(username) {
            Some(Credential::Plain(stored)) => stored.as_bytes() == password,
            Some(Credential::Hash(stored)) => PasswordHash::new(stored)
                .map(|parsed| Argon2::default().verify_password(password, &parsed).is_ok())
                .unwrap_or(false),
            None => false,
        }
    }
}

#[async_trait]
impl Hooks for AuthPlugin {
    async fn on_basic_auth(&self, client: &ClientInfo, password: Option<&[u8]>) -> HookResult<Verdict> {
        let Some(username) = client.username() else {
            return Ok(if self.allow_anonymous {
                Verdict::Continue
            } else {
                Verdict::Deny
            });
        };
        if self.verify(username, password.unwrap_or(&[])) {
            Ok(Verdict::Continue)
        } else {
            debug!(client_id = %client.client_id, username, "bad credentials");
            Ok(Verdict::Deny)
        }
    }
}

#[async_trait]
impl Plugin for AuthPlugin {
    fn name(&self) -> &str {
        NAME
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register(NAME, json!({"allow_anonymous": true, "users": []}), |settings| {
        let settings: AuthSettings = crate::hooks::decode_settings(NAME, settings)?;
        Ok(Arc::new(AuthPlugin::new(settings)?) as Arc<dyn Plugin>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{PasswordHasher, SaltString};

    fn user(name: &str, password: Option<&str>, hash: Option<&str>) -> UserConfig {
        UserConfig {
            username: name.to_string(),
            password: password.map(str::to_string),
            password_hash: hash.map(str::to_string),
        }
    }

    fn hash(password: &str) -> String {
        let salt = SaltString::from_b64("bWVzaG1xdGVzdHNhbHQ").unwrap();
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    fn plugin(allow_anonymous: bool, users: Vec<UserConfig>) -> AuthPlugin {
        AuthPlugin::new(AuthSettings {
            allow_anonymous,
            users,
        })
        .unwrap()
    }

    async fn auth(p: &AuthPlugin, username: Option<&str>, password: Option<&[u8]>) -> Verdict {
        p.on_basic_auth(&ClientInfo::new("c1", username, 1), password)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_plaintext() {
        let p = plugin(false, vec![user("alice", Some("pw"), None)]);
        assert_eq!(auth(&p, Some("alice"), Some(b"pw")).await, Verdict::Continue);
        assert_eq!(auth(&p, Some("alice"), Some(b"nope")).await, Verdict::Deny);
        assert_eq!(auth(&p, Some("alice"), None).await, Verdict::Deny);
        assert_eq!(auth(&p, Some("bob"), Some(b"pw")).await, Verdict::Deny);
    }

    #[tokio::test]
    async fn test_argon2_hash() {
        let h = hash("secret");
        let p = plugin(false, vec![user("admin", None, Some(&h))]);
        assert_eq!(auth(&p, Some("admin"), Some(b"secret")).await, Verdict::Continue);
        assert_eq!(auth(&p, Some("admin"), Some(b"wrong")).await, Verdict::Deny);
    }

    #[tokio::test]
    async fn test_anonymous() {
        let open = plugin(true, vec![]);
        assert_eq!(auth(&open, None, None).await, Verdict::Continue);
        let closed = plugin(false, vec![]);
        assert_eq!(auth(&closed, None, None).await, Verdict::Deny);
    }

    #[test]
    fn test_invalid_users_rejected() {
        let bad = [
            user("a", None, None),
            user("a", Some("x"), Some("$argon2id$")),
            user("a", Some(""), None),
            user("a", None, Some("plain")),
        ];
        for u in bad {
            let result = AuthPlugin::new(AuthSettings {
                allow_anonymous: true,
                users: vec![u],
            });
            assert!(matches!(result, Err(ConfigError::Plugin { .. })));
        }
    }

    #[test]
    fn test_registered_with_defaults() {
        let registry = PluginRegistry::with_defaults();
        let settings = registry.settings(NAME, None).unwrap();
        assert_eq!(settings["allow_anonymous"], json!(true));
    }
}
