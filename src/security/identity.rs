//! Caller identity resolution for rate limiting.
//!
//! Precedence: authenticated user, then API key, then client IP, then the
//! shared anonymous bucket.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context attached to a request by upstream authentication.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CallerContext {
    pub user_id: String,
    /// Subscription tier name, looked up in the tier multiplier table.
    pub tier: Option<String>,
}

/// Whom a rate limit applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    User(String),
    /// Fingerprint of the key; raw keys never reach the store.
    ApiKey(String),
    Ip(IpAddr),
    Anonymous,
}

impl Subject {
    pub fn api_key(raw: &str) -> Self {
        let fingerprint = Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes());
        Self::ApiKey(fingerprint.simple().to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::ApiKey(_) => "apikey",
            Self::Ip(_) => "ip",
            Self::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::ApiKey(fp) => write!(f, "apikey:{fp}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
            Self::Anonymous => f.write_str("anonymous"),
        }
    }
}

/// Raw identity material gathered from a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub ip: Option<IpAddr>,
}

impl RequestIdentity {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            ..Self::default()
        }
    }

    /// Most specific subject available. Blank values are ignored.
    pub fn subject(&self) -> Subject {
        if let Some(id) = non_blank(&self.user_id) {
            return Subject::User(id.to_string());
        }
        if let Some(key) = non_blank(&self.api_key) {
            return Subject::api_key(key);
        }
        match self.ip {
            Some(ip) => Subject::Ip(ip),
            None => Subject::Anonymous,
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_precedence() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let full = RequestIdentity {
            user_id: Some("u-1".into()),
            api_key: Some("secret".into()),
            ip: Some(ip),
        };
        assert_eq!(full.subject(), Subject::User("u-1".into()));

        let keyed = RequestIdentity {
            user_id: Some("   ".into()),
            ..full.clone()
        };
        assert_eq!(keyed.subject().kind(), "apikey");

        assert_eq!(RequestIdentity::ip(ip).subject().to_string(), "ip:10.0.0.7");
        assert_eq!(RequestIdentity::default().subject(), Subject::Anonymous);
    }

    #[test]
    fn test_api_key_fingerprint_is_stable_and_opaque() {
        let a = Subject::api_key("sk_live_123");
        let b = Subject::api_key("sk_live_123");
        assert_eq!(a, b);
        assert!(!a.to_string().contains("sk_live_123"));
        assert_ne!(a, Subject::api_key("sk_live_124"));
    }
}
