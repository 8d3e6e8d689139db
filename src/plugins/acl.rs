//! ACL (Access Control List) plugin
//!
//! Topic-based authorization with support for:
//! - MQTT wildcards (# and +) in patterns
//! - Variable substitution (%c = client_id, %u = username)
//! - Role-based permissions, roles assigned to usernames
//!
//! A subscription is allowed only if the pattern covers every topic the
//! requested filter could match, so `sensors/+` does not grant
//! `sensors/#`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::ConfigError;
use crate::hooks::{ClientInfo, HookResult, Hooks, Plugin, PluginRegistry, Verdict};
use crate::protocol::Message;
use crate::topic::Subscription;

pub const NAME: &str = "acl";

/// Settings under `plugins.config.acl`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AclSettings {
    pub roles: Vec<AclRole>,
    /// Permissions for users without a role, including anonymous clients
    pub default: AclPermissions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    pub name: String,
    /// Usernames holding this role
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub subscribe: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AclPermissions {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

/// Does `pattern` allow everything `filter` can match? Works for plain
/// topic names too. A trailing `#` also covers its parent level.
fn pattern_covers(pattern: &str, filter: &str) -> bool {
    let mut p = pattern.split('/');
    let mut f = filter.split('/');
    loop {
        match (p.next(), f.next()) {
            (Some("#"), _) => return true,
            (Some(_), Some("#")) => return false,
            (Some("+"), Some(_)) => {}
            (Some(pl), Some(fl)) if pl == fl && fl != "+" => {}
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            (Some(_), None) | (None, Some(_)) => return false,
        }
    }
}

/// Substitute `%c`/`%u`. None if a value is missing or could widen the
/// pattern.
fn expand(pattern: &str, client_id: &str, username: Option<&str>) -> Option<String> {
    let unsafe_value = |v: &str| v.contains(['/', '+', '#']);
    let mut out = pattern.to_string();
    if out.contains("%c") {
        if unsafe_value(client_id) {
            return None;
        }
        out = out.replace("%c", client_id);
    }
    if out.contains("%u") {
        let username = username.filter(|u| !unsafe_value(u))?;
        out = out.replace("%u", username);
    }
    Some(out)
}

fn check_patterns(patterns: &[String], target: &str, client: &ClientInfo) -> bool {
    patterns.iter().any(|p| {
        expand(p, &client.client_id, client.username())
            .is_some_and(|expanded| pattern_covers(&expanded, target))
    })
}

/// Role-based topic permissions
pub struct AclPlugin {
    roles: Vec<AclPermissions>,
    /// username -> index into `roles`
    user_roles: HashMap<String, usize>,
    default: AclPermissions,
}

impl AclPlugin {
    pub fn new(settings: AclSettings) -> Result<Self, ConfigError> {
        let mut roles = Vec::with_capacity(settings.roles.len());
        let mut user_roles = HashMap::new();
        for (index, role) in settings.roles.into_iter().enumerate() {
            for user in role.users {
                if user_roles.insert(user.clone(), index).is_some() {
                    return Err(ConfigError::Plugin {
                        name: NAME.to_string(),
                        reason: format!("user '{}' is assigned more than one role", user),
                    });
                }
            }
            roles.push(AclPermissions {
                publish: role.publish,
                subscribe: role.subscribe,
            });
        }
        Ok(Self {
            roles,
            user_roles,
            default: settings.default,
        })
    }

    fn permissions(&self, client: &ClientInfo) -> &AclPermissions {
        client
            .username()
            .and_then(|u| self.user_roles.get(u))
            .and_then(|i| self.roles.get(*i))
            .unwrap_or(&self.default)
    }

    pub fn can_publish(&self, client: &ClientInfo, topic: &str) -> bool {
        check_patterns(&self.permissions(client).publish, topic, client)
    }

    pub fn can_subscribe(&self, client: &ClientInfo, filter: &str) -> bool {
        check_patterns(&self.permissions(client).subscribe, filter, client)
    }
}

fn verdict(allowed: bool) -> Verdict {
    if allowed {
        Verdict::Continue
    } else {
        Verdict::Deny
    }
}

#[async_trait]
impl Hooks for AclPlugin {
    async fn on_subscribe(&self, client: &ClientInfo, subscription: &mut Subscription) -> HookResult<Verdict> {
        Ok(verdict(self.can_subscribe(client, &subscription.filter)))
    }

    async fn on_msg_arrived(&self, client: &ClientInfo, message: &mut Message) -> HookResult<Verdict> {
        Ok(verdict(self.can_publish(client, &message.topic)))
    }
}

#[async_trait]
impl Plugin for AclPlugin {
    fn name(&self) -> &str {
        NAME
    }
}

pub fn register(registry: &mut PluginRegistry) {
    registry.register(
        NAME,
        json!({"roles": [], "default": {"publish": [], "subscribe": []}}),
        |settings| {
            let settings: AclSettings = crate::hooks::decode_settings(NAME, settings)?;
            Ok(Arc::new(AclPlugin::new(settings)?) as Arc<dyn Plugin>)
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn plugin() -> AclPlugin {
        let settings: AclSettings = serde_json::from_value(json!({
            "roles": [
                {"name": "admin", "users": ["admin"], "publish": ["#"], "subscribe": ["#"]},
                {"name": "device", "users": ["sensor"],
                 "publish": ["sensors/%c/#"], "subscribe": ["commands/%c/#"]},
                {"name": "reader", "users": ["readonly"], "subscribe": ["sensors/+/temp"]}
            ],
            "default": {"subscribe": ["$SYS/broker/+", "users/%u/inbox"]}
        }))
        .unwrap();
        AclPlugin::new(settings).unwrap()
    }

    fn client(id: &str, user: Option<&str>) -> ClientInfo {
        ClientInfo::new(id, user, 1)
    }

    #[test_case("foo/bar", "foo/bar", true ; "exact")]
    #[test_case("foo/bar", "foo/baz", false ; "exact mismatch")]
    #[test_case("foo/+/bar", "foo/x/bar", true ; "single level")]
    #[test_case("foo/+", "foo/bar/baz", false ; "single level too deep")]
    #[test_case("foo/#", "foo", true ; "multi level covers parent")]
    #[test_case("foo/#", "foo/bar/baz", true ; "multi level")]
    #[test_case("foo/+", "foo/#", false ; "plus does not cover hash")]
    #[test_case("foo/+", "foo/+", true ; "plus covers plus")]
    #[test_case("foo/bar", "foo/+", false ; "literal does not cover plus")]
    #[test_case("foo/#", "foo/+/x", true ; "hash covers filter")]
    fn test_pattern_covers(pattern: &str, filter: &str, expected: bool) {
        assert_eq!(pattern_covers(pattern, filter), expected);
    }

    #[test]
    fn test_substitution() {
        let p = plugin();
        let sensor = client("dev1", Some("sensor"));
        assert!(p.can_publish(&sensor, "sensors/dev1/temp"));
        assert!(!p.can_publish(&sensor, "sensors/dev2/temp"));
        assert!(p.can_subscribe(&sensor, "commands/dev1/#"));
        assert!(!p.can_subscribe(&sensor, "commands/#"));
    }

    #[test]
    fn test_wildcard_client_id_cannot_widen() {
        let p = plugin();
        let sneaky = client("#", Some("sensor"));
        assert!(!p.can_publish(&sneaky, "sensors/anything/x"));
    }

    #[test]
    fn test_default_permissions() {
        let p = plugin();
        let anon = client("c1", None);
        assert!(p.can_subscribe(&anon, "$SYS/broker/uptime"));
        assert!(!p.can_subscribe(&anon, "users//inbox"));
        assert!(!p.can_publish(&anon, "anything"));

        let bob = client("c2", Some("bob"));
        assert!(p.can_subscribe(&bob, "users/bob/inbox"));
        assert!(!p.can_subscribe(&bob, "users/alice/inbox"));
    }

    #[test]
    fn test_reader_role() {
        let p = plugin();
        let reader = client("r", Some("readonly"));
        assert!(p.can_subscribe(&reader, "sensors/1/temp"));
        assert!(!p.can_subscribe(&reader, "sensors/#"));
        assert!(!p.can_publish(&reader, "sensors/1/temp"));
    }

    #[tokio::test]
    async fn test_hooks_verdicts() {
        use crate::protocol::{QoS, SubscriptionOptions};
        let p = plugin();
        let admin = client("a", Some("admin"));
        let mut sub = Subscription::parse("a", "x/#", SubscriptionOptions::default()).unwrap();
        assert_eq!(p.on_subscribe(&admin, &mut sub).await.unwrap(), Verdict::Continue);

        let anon = client("b", None);
        let mut msg = Message::new("x", bytes::Bytes::new(), QoS::AtMostOnce);
        assert_eq!(p.on_msg_arrived(&anon, &mut msg).await.unwrap(), Verdict::Deny);
    }

    #[test]
    fn test_user_in_two_roles_rejected() {
        let settings: AclSettings = serde_json::from_value(json!({
            "roles": [
                {"name": "a", "users": ["u"]},
                {"name": "b", "users": ["u"]}
            ]
        }))
        .unwrap();
        assert!(AclPlugin::new(settings).is_err());
    }
}
