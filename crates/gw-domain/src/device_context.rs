//! `DeviceContext`: the authenticated identity and authorization claims
//! for one session, per §3 Data Model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device role. Defaults to `"device"` when the `role` claim is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role(pub String);

impl Default for Role {
    fn default() -> Self {
        Role("device".to_string())
    }
}

/// Authenticated identity and authorization claims for one session.
///
/// Immutable after issuance. Never shared across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceContext {
    pub client_id: String,
    pub role: Role,
    /// Ordered publish subject patterns. Empty denies all publishes.
    pub pub_patterns: Vec<String>,
    /// Ordered subscribe subject patterns. Empty denies all subscribes.
    pub sub_patterns: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl DeviceContext {
    /// `true` once `now` is past `expires_at + clock_skew`. No grace period
    /// beyond the configured skew.
    pub fn is_expired(&self, now: DateTime<Utc>, clock_skew: chrono::Duration) -> bool {
        now > self.expires_at + clock_skew
    }
}

/// Raw claims as they would be deserialized from a JWT, before the
/// pub/subscribe fields (which accept either a JSON array or a
/// comma-separated string) are normalized into `Vec<String>`.
#[derive(Debug, Deserialize)]
pub struct RawClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, rename = "pub")]
    pub pub_: Option<PatternList>,
    #[serde(default)]
    pub subscribe: Option<PatternList>,
    pub exp: i64,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<AudienceClaim>,
}

/// `pub`/`subscribe` accept either a JSON array of strings or a single
/// comma-separated string; both forms normalize to the same `Vec<String>`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PatternList {
    Array(Vec<String>),
    Csv(String),
}

impl PatternList {
    pub fn into_patterns(self) -> Vec<String> {
        match self {
            PatternList::Array(v) => v,
            PatternList::Csv(s) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }
}

/// `aud` may be a single string or an array of strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AudienceClaim {
    One(String),
    Many(Vec<String>),
}

impl AudienceClaim {
    pub fn contains(&self, expected: &str) -> bool {
        match self {
            AudienceClaim::One(a) => a == expected,
            AudienceClaim::Many(v) => v.iter().any(|a| a == expected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ctx(expires_at: DateTime<Utc>) -> DeviceContext {
        DeviceContext {
            client_id: "dev-1".to_string(),
            role: Role::default(),
            pub_patterns: vec!["factory.line1.temp".to_string()],
            sub_patterns: vec![],
            expires_at,
        }
    }

    #[test]
    fn expired_exactly_at_instant_with_no_skew_is_expired_only_when_strictly_past() {
        let now = Utc::now();
        let c = ctx(now);
        assert!(!c.is_expired(now, Duration::zero()));
        assert!(c.is_expired(now + Duration::milliseconds(1), Duration::zero()));
    }

    #[test]
    fn clock_skew_extends_the_grace_window() {
        let now = Utc::now();
        let c = ctx(now - Duration::seconds(5));
        assert!(!c.is_expired(now, Duration::seconds(10)));
        assert!(c.is_expired(now, Duration::seconds(1)));
    }

    #[test]
    fn pattern_list_accepts_array_and_csv_forms() {
        let array = PatternList::Array(vec!["a.b".to_string(), "c.>".to_string()]);
        assert_eq!(array.into_patterns(), vec!["a.b", "c.>"]);

        let csv = PatternList::Csv(" a.b , c.> ".to_string());
        assert_eq!(csv.into_patterns(), vec!["a.b", "c.>"]);
    }

    #[test]
    fn empty_pub_patterns_means_deny_all() {
        let c = DeviceContext {
            pub_patterns: vec![],
            ..ctx(Utc::now() + Duration::hours(1))
        };
        assert!(c.pub_patterns.is_empty());
    }
}
