// File: parley-common/src/models/account.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// IM protocol an account speaks. Anything we don't know by name is carried as `Other`
/// so a custom plugin can still be registered for it.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    Icq,
    Aim,
    Irc,
    Xmpp,
    Other(String),
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Icq => write!(f, "icq"),
            Protocol::Aim => write!(f, "aim"),
            Protocol::Irc => write!(f, "irc"),
            Protocol::Xmpp => write!(f, "xmpp"),
            Protocol::Other(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        if name.is_empty() {
            return Err("Empty protocol name".to_string());
        }
        Ok(match name.as_str() {
            "icq" => Protocol::Icq,
            "aim" | "oscar" => Protocol::Aim,
            "irc" => Protocol::Irc,
            "xmpp" | "jabber" => Protocol::Xmpp,
            _ => Protocol::Other(name),
        })
    }
}

impl From<String> for Protocol {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(Protocol::Other(s))
    }
}

impl From<Protocol> for String {
    fn from(p: Protocol) -> Self {
        p.to_string()
    }
}

/// Handle into the account registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub u32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account#{}", self.0)
    }
}

/// One configured IM identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub protocol: Protocol,
    pub username: String,
    pub secret: String,
    pub display_name: String,
    /// Server override from the account URI, if any.
    pub server: Option<String>,
    pub port: Option<u16>,
}

impl Account {
    pub fn new(protocol: Protocol, username: impl Into<String>, secret: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            protocol,
            display_name: username.clone(),
            username,
            secret: secret.into(),
            server: None,
            port: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_server(mut self, server: impl Into<String>, port: Option<u16>) -> Self {
        self.server = Some(server.into());
        self.port = port;
        self
    }

    /// Key used for uniqueness checks: usernames compare case-insensitively.
    pub fn normalized_username(&self) -> String {
        normalize_name(&self.username)
    }
}

// Keep the secret out of logs.
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("display_name", &self.display_name)
            .field("server", &self.server)
            .field("port", &self.port)
            .finish()
    }
}

/// Case-folds a user, buddy or room name for comparisons.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_aliases() {
        assert_eq!("ICQ".parse::<Protocol>().unwrap(), Protocol::Icq);
        assert_eq!("jabber".parse::<Protocol>().unwrap(), Protocol::Xmpp);
        assert_eq!("oscar".parse::<Protocol>().unwrap(), Protocol::Aim);
        assert_eq!(
            "Matrix".parse::<Protocol>().unwrap(),
            Protocol::Other("matrix".to_string())
        );
        assert!("  ".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_protocol_serde_as_string() {
        let json = serde_json::to_string(&Protocol::Irc).unwrap();
        assert_eq!(json, "\"irc\"");
        let back: Protocol = serde_json::from_str("\"xmpp\"").unwrap();
        assert_eq!(back, Protocol::Xmpp);
    }

    #[test]
    fn test_account_debug_hides_secret() {
        let acct = Account::new(Protocol::Icq, "12345", "hunter2");
        let dbg = format!("{:?}", acct);
        assert!(!dbg.contains("hunter2"));
        assert_eq!(acct.display_name, "12345");
    }
}
