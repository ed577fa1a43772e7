//! Label selectors for sync sessions and forwards
//!
//! Grammar, one token per `--selector` flag:
//!
//! | token  | matches when                              |
//! |--------|-------------------------------------------|
//! | `k=v`  | label `k` equals `v`                      |
//! | `!k=v` | label `k` is absent or differs from `v`   |
//! | `k`    | label `k` is present                      |
//! | `!k`   | label `k` is absent                       |
//!
//! All tokens must match.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// One selector term
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        }
    }
}

impl FromStr for Requirement {
    type Err = StoreError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let token = token.trim();
        let (negated, body) = match token.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, token),
        };

        let invalid = |message: &str| StoreError::Invalid {
            field: "selector",
            message: format!("{}: {:?}", message, token),
        };

        let requirement = match body.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(invalid("empty label key"));
                }
                let value = value.trim().to_string();
                if negated {
                    Requirement::NotEquals(key.to_string(), value)
                } else {
                    Requirement::Equals(key.to_string(), value)
                }
            }
            None => {
                let key = body.trim();
                if key.is_empty() {
                    return Err(invalid("empty label key"));
                }
                if negated {
                    Requirement::NotExists(key.to_string())
                } else {
                    Requirement::Exists(key.to_string())
                }
            }
        };
        Ok(requirement)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "!{}={}", k, v),
            Requirement::Exists(k) => write!(f, "{}", k),
            Requirement::NotExists(k) => write!(f, "!{}", k),
        }
    }
}

/// Conjunction of requirements; the empty selector matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Self, StoreError> {
        let requirements = tokens
            .iter()
            .map(|t| t.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

/// Parse `k=v` label assignments (as given to `--label`)
pub fn parse_labels<S: AsRef<str>>(pairs: &[S]) -> Result<BTreeMap<String, String>, StoreError> {
    let mut labels = BTreeMap::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, value) = pair.split_once('=').ok_or_else(|| StoreError::Invalid {
            field: "label",
            message: format!("expected key=value, got {:?}", pair),
        })?;
        let key = key.trim();
        if key.is_empty() || key.starts_with('!') {
            return Err(StoreError::Invalid {
                field: "label",
                message: format!("invalid label key in {:?}", pair),
            });
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_tokens() {
        let selector = LabelSelector::parse(&["env=prod", "!env=dev", "team", "!archived"]).unwrap();
        assert_eq!(
            selector.requirements(),
            &[
                Requirement::Equals("env".into(), "prod".into()),
                Requirement::NotEquals("env".into(), "dev".into()),
                Requirement::Exists("team".into()),
                Requirement::NotExists("archived".into()),
            ]
        );
    }

    #[test]
    fn test_env_prod_and_not_archived() {
        let selector = LabelSelector::parse(&["env=prod", "!archived"]).unwrap();

        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(selector.matches(&labels(&[("env", "prod"), ("team", "a")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("archived", "yes")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_not_equals_matches_absent() {
        let selector = LabelSelector::parse(&["!env=prod"]).unwrap();
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn test_empty_selector_matches_all() {
        let selector = LabelSelector::parse::<&str>(&[]).unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[("x", "y")])));
    }

    #[test]
    fn test_rejects_empty_keys() {
        assert!(LabelSelector::parse(&["=v"]).is_err());
        assert!(LabelSelector::parse(&["!"]).is_err());
        assert!(LabelSelector::parse(&[""]).is_err());
    }

    #[test]
    fn test_parse_labels() {
        let parsed = parse_labels(&["env=prod", "team = core"]).unwrap();
        assert_eq!(parsed, labels(&[("env", "prod"), ("team", "core")]));
        assert!(parse_labels(&["novalue"]).is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for token in ["a=b", "!a=b", "a", "!a"] {
            let req: Requirement = token.parse().unwrap();
            assert_eq!(req.to_string(), token);
        }
    }
}
