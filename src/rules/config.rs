//! Declarative rule configuration
//!
//! Loaded once at startup from `RULES_PATH`, or from the built-in document
//! compiled into the binary.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::domain::{validate_text, EventType, ProjectKey, Token};
use crate::infra::{LedgerError, Result};

/// Rule document shipped with the service
pub const DEFAULT_RULES_JSON: &str = include_str!("../../config/rules.default.json");

/// Root of a rules document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Per-token policy; tokens not listed use the default policy
    #[serde(default)]
    pub tokens: BTreeMap<Token, TokenPolicy>,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Balance policy for one token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPolicy {
    /// Allow the balance to go below zero
    #[serde(default)]
    pub allow_overdraft: bool,
}

/// Rewards granted for one (project, event type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// `None` makes this the default rule for every project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_key: Option<ProjectKey>,

    pub event_type: EventType,

    pub rewards: Vec<RewardConfig>,

    /// Reward at most one event per user in each window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub once_per: Option<ClaimWindow>,
}

/// Window of a once-per-window rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimWindow {
    /// UTC calendar day
    Day,
}

impl ClaimWindow {
    /// First day of the window containing `at`.
    pub fn start_of(self, at: DateTime<Utc>) -> NaiveDate {
        match self {
            ClaimWindow::Day => at.date_naive(),
        }
    }
}

/// One balance change produced by a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardConfig {
    pub token: Token,

    pub kind: RewardKind,

    pub amount: AmountSpec,

    /// Property values that must all match for this reward to apply
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub when: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Credit,
    Debit,
}

/// How the magnitude of a reward is computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AmountSpec {
    /// Constant amount
    Fixed { value: i64 },

    /// Integer event property, scaled and optionally capped
    Property {
        name: String,
        #[serde(default = "default_multiplier")]
        multiplier: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
}

fn default_multiplier() -> i64 {
    1
}

impl RulesConfig {
    /// Parse a JSON rules document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| LedgerError::Configuration(format!("invalid rules document: {e}")))
    }

    /// Read and parse a rules file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            LedgerError::Configuration(format!("cannot read rules file {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// The document compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_json(DEFAULT_RULES_JSON)
    }

    /// Reject documents the engine cannot evaluate unambiguously.
    pub fn validate(&self) -> Result<()> {
        self.check().map_err(|e| match e {
            LedgerError::Validation(v) => {
                LedgerError::Configuration(format!("invalid rules document: {v}"))
            }
            other => other,
        })
    }

    fn check(&self) -> Result<()> {
        for token in self.tokens.keys() {
            token.validate()?;
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if let Some(project) = &rule.project_key {
                project.validate()?;
            }
            rule.event_type.validate()?;

            if !seen.insert((rule.project_key.clone(), rule.event_type.clone())) {
                return Err(LedgerError::Configuration(format!(
                    "duplicate rule for project {} event {}",
                    rule.project_key.as_ref().map_or("*", |p| p.as_str()),
                    rule.event_type
                )));
            }

            for reward in &rule.rewards {
                reward.token.validate()?;
                reward.amount.validate(&rule.event_type)?;
            }
        }
        Ok(())
    }
}

impl AmountSpec {
    fn validate(&self, event_type: &EventType) -> Result<()> {
        let invalid = |what: &str| {
            Err(LedgerError::Configuration(format!(
                "rule for {event_type}: {what} must be positive"
            )))
        };

        match self {
            AmountSpec::Fixed { value } if *value <= 0 => invalid("fixed amount"),
            AmountSpec::Fixed { .. } => Ok(()),
            AmountSpec::Property {
                name,
                multiplier,
                max,
            } => {
                validate_text("amount.name", name, 64)?;
                if *multiplier <= 0 {
                    return invalid("multiplier");
                }
                if matches!(max, Some(m) if *m <= 0) {
                    return invalid("max");
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_document_is_valid() {
        let config = RulesConfig::builtin().unwrap();
        config.validate().unwrap();
        assert_eq!(config.rules.len(), 5);
        assert!(!config.tokens[&Token::tgem()].allow_overdraft);

        let daily = config
            .rules
            .iter()
            .find(|r| r.event_type.as_str() == "daily_login")
            .unwrap();
        assert_eq!(daily.once_per, Some(ClaimWindow::Day));
    }

    #[test]
    fn test_once_per_parses_and_windows_by_utc_day() {
        let config = RulesConfig::from_json(
            r#"{"rules":[{"event_type":"daily_login","once_per":"day","rewards":[]}]}"#,
        )
        .unwrap();
        assert_eq!(config.rules[0].once_per, Some(ClaimWindow::Day));

        let late = DateTime::parse_from_rfc3339("2026-10-19T23:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = DateTime::parse_from_rfc3339("2026-10-20T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_ne!(ClaimWindow::Day.start_of(late), ClaimWindow::Day.start_of(next));

        let unknown = RulesConfig::from_json(
            r#"{"rules":[{"event_type":"daily_login","once_per":"fortnight","rewards":[]}]}"#,
        );
        assert!(unknown.is_err());
    }

    #[test]
    fn test_property_amount_defaults() {
        let config = RulesConfig::from_json(
            r#"{"rules":[{"event_type":"purchase","rewards":[
                {"token":"tgem","kind":"credit","amount":{"type":"property","name":"amount"}}
            ]}]}"#,
        )
        .unwrap();

        assert_eq!(
            config.rules[0].rewards[0].amount,
            AmountSpec::Property {
                name: "amount".into(),
                multiplier: 1,
                max: None
            }
        );
        assert!(config.tokens.is_empty());
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let config = RulesConfig::from_json(
            r#"{"rules":[
                {"event_type":"referral","rewards":[]},
                {"event_type":"referral","rewards":[]}
            ]}"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, LedgerError::Configuration(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_project_override_is_not_duplicate() {
        let config = RulesConfig::from_json(
            r#"{"rules":[
                {"event_type":"referral","rewards":[]},
                {"project_key":"p1","event_type":"referral","rewards":[]}
            ]}"#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_non_positive_amounts_rejected() {
        for amount in [
            r#"{"type":"fixed","value":0}"#,
            r#"{"type":"property","name":"amount","multiplier":0}"#,
            r#"{"type":"property","name":"amount","max":-1}"#,
        ] {
            let json = format!(
                r#"{{"rules":[{{"event_type":"purchase","rewards":[
                    {{"token":"tgem","kind":"credit","amount":{amount}}}
                ]}}]}}"#
            );
            let config = RulesConfig::from_json(&json).unwrap();
            assert!(config.validate().is_err(), "accepted {amount}");
        }
    }

    #[test]
    fn test_empty_token_rejected() {
        let config = RulesConfig::from_json(
            r#"{"rules":[{"event_type":"purchase","rewards":[
                {"token":"","kind":"credit","amount":{"type":"fixed","value":1}}
            ]}]}"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, LedgerError::Configuration(msg) if msg.contains("token")));
    }

    #[test]
    fn test_malformed_document_is_configuration_error() {
        let err = RulesConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, LedgerError::Configuration(_)));
    }
}
