//! Reward rule engine
//!
//! Maps a ledger event to the balance changes it earns. Evaluation is pure:
//! the same event and rule set always produce the same instructions, so
//! instructions never need to be stored. Rules limited to one reward per
//! window also name the [`RewardClaim`] an event must hold to be credited.

mod config;

pub use config::*;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::domain::{
    DistributionInstruction, Event, EventType, ProjectKey, RewardClaim, Token,
};
use crate::infra::Result;

#[derive(Debug, Clone)]
struct CompiledRule {
    rewards: Vec<RewardConfig>,
    once_per: Option<ClaimWindow>,
}

/// Compiled rule set
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: HashMap<(Option<ProjectKey>, EventType), CompiledRule>,
    tokens: BTreeMap<Token, TokenPolicy>,
}

impl RuleEngine {
    /// Validate and compile a rules document.
    pub fn new(config: RulesConfig) -> Result<Self> {
        config.validate()?;

        let rules = config
            .rules
            .into_iter()
            .map(|rule| {
                let compiled = CompiledRule {
                    rewards: rule.rewards,
                    once_per: rule.once_per,
                };
                ((rule.project_key, rule.event_type), compiled)
            })
            .collect();

        Ok(Self {
            rules,
            tokens: config.tokens,
        })
    }

    /// Engine over the built-in document.
    pub fn builtin() -> Result<Self> {
        Self::new(RulesConfig::builtin()?)
    }

    /// Engine over a rules file, or the built-in document when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::new(RulesConfig::from_path(path)?),
            None => Self::builtin(),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Balance policy for `token`; unlisted tokens forbid overdraft.
    pub fn policy(&self, token: &Token) -> TokenPolicy {
        self.tokens.get(token).copied().unwrap_or_default()
    }

    pub fn allows_overdraft(&self, token: &Token) -> bool {
        self.policy(token).allow_overdraft
    }

    /// Instructions earned by `event`, one per token, in token order.
    ///
    /// Unknown event types and rewards whose amount cannot be computed
    /// produce nothing. Rewards for the same token are summed and a zero
    /// net change is dropped.
    pub fn evaluate(&self, event: &Event) -> Vec<DistributionInstruction> {
        let Some(rule) = self.rule_for(&event.project_key, &event.event_type) else {
            return Vec::new();
        };

        let mut totals: BTreeMap<&Token, i64> = BTreeMap::new();
        for reward in &rule.rewards {
            if !conditions_match(&reward.when, event) {
                continue;
            }
            let Some(magnitude) = reward.amount.resolve(event) else {
                continue;
            };
            let signed = match reward.kind {
                RewardKind::Credit => magnitude,
                RewardKind::Debit => -magnitude,
            };
            let total = totals.entry(&reward.token).or_insert(0);
            *total = total.saturating_add(signed);
        }

        totals
            .into_iter()
            .filter(|(_, amount)| *amount != 0)
            .map(|(token, amount)| DistributionInstruction {
                event_id: event.id,
                project_key: event.project_key.clone(),
                user_id: event.user_id.clone(),
                token: token.clone(),
                amount,
            })
            .collect()
    }

    /// Claim `event` must hold to be credited, when its rule rewards only
    /// one event per window. The window comes from `received_at`.
    pub fn claim_for(&self, event: &Event) -> Option<RewardClaim> {
        let window = self
            .rule_for(&event.project_key, &event.event_type)?
            .once_per?;

        Some(RewardClaim {
            project_key: event.project_key.clone(),
            user_id: event.user_id.clone(),
            event_type: event.event_type.clone(),
            window_start: window.start_of(event.received_at),
        })
    }

    fn rule_for(&self, project: &ProjectKey, event_type: &EventType) -> Option<&CompiledRule> {
        self.rules
            .get(&(Some(project.clone()), event_type.clone()))
            .or_else(|| self.rules.get(&(None, event_type.clone())))
    }
}

fn conditions_match(when: &BTreeMap<String, serde_json::Value>, event: &Event) -> bool {
    when.iter()
        .all(|(name, expected)| event.properties.get(name) == Some(expected))
}

impl AmountSpec {
    /// Positive magnitude for `event`, if one can be computed.
    fn resolve(&self, event: &Event) -> Option<i64> {
        match self {
            AmountSpec::Fixed { value } => Some(*value),
            AmountSpec::Property {
                name,
                multiplier,
                max,
            } => {
                let raw = event.integer_property(name).filter(|v| *v > 0)?;
                let scaled = raw.saturating_mul(*multiplier);
                Some(max.map_or(scaled, |cap| scaled.min(cap)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewEvent;
    use chrono::Utc;
    use serde_json::json;

    fn event(project: &str, event_type: &str, props: serde_json::Value) -> Event {
        let properties = match props {
            serde_json::Value::Object(map) => map,
            _ => Default::default(),
        };
        NewEvent::new(project, "u1", event_type)
            .with_properties(properties)
            .into_event(Utc::now())
            .unwrap()
    }

    fn engine(json: &str) -> RuleEngine {
        RuleEngine::new(RulesConfig::from_json(json).unwrap()).unwrap()
    }

    #[test]
    fn test_purchase_credits_amount() {
        let engine = RuleEngine::builtin().unwrap();
        let instructions = engine.evaluate(&event("p1", "purchase", json!({"amount": 10})));

        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].token, Token::tgem());
        assert_eq!(instructions[0].amount, 10);
    }

    #[test]
    fn test_redeem_catalog_debits() {
        let engine = RuleEngine::builtin().unwrap();
        let instructions = engine.evaluate(&event(
            "p1",
            "redeem_catalog",
            json!({"amount": 4, "itemId": "hat"}),
        ));

        assert_eq!(instructions[0].amount, -4);
    }

    #[test]
    fn test_unknown_event_type_yields_nothing() {
        let engine = RuleEngine::builtin().unwrap();
        assert!(engine.evaluate(&event("p1", "page_view", json!({}))).is_empty());
    }

    #[test]
    fn test_missing_or_bad_amount_yields_nothing() {
        let engine = RuleEngine::builtin().unwrap();
        for props in [
            json!({}),
            json!({"amount": "10"}),
            json!({"amount": 0}),
            json!({"amount": -3}),
            json!({"amount": 2.5}),
        ] {
            assert!(
                engine.evaluate(&event("p1", "purchase", props.clone())).is_empty(),
                "produced instructions for {props}"
            );
        }
    }

    #[test]
    fn test_project_rule_overrides_default() {
        let engine = engine(
            r#"{"rules":[
                {"event_type":"daily_login","rewards":[
                    {"token":"tgem","kind":"credit","amount":{"type":"fixed","value":5}}]},
                {"project_key":"p2","event_type":"daily_login","rewards":[
                    {"token":"partner","kind":"credit","amount":{"type":"fixed","value":2}}]}
            ]}"#,
        );

        let default = engine.evaluate(&event("p1", "daily_login", json!({})));
        assert_eq!(default[0].token, Token::tgem());

        let overridden = engine.evaluate(&event("p2", "daily_login", json!({})));
        assert_eq!(overridden.len(), 1);
        assert_eq!(overridden[0].token, Token::partner());
        assert_eq!(overridden[0].amount, 2);
    }

    #[test]
    fn test_same_token_rewards_summed() {
        let engine = engine(
            r#"{"rules":[{"event_type":"purchase","rewards":[
                {"token":"tgem","kind":"credit","amount":{"type":"property","name":"amount"}},
                {"token":"tgem","kind":"credit","amount":{"type":"fixed","value":3}},
                {"token":"partner","kind":"credit","amount":{"type":"property","name":"amount","multiplier":2,"max":15}}
            ]}]}"#,
        );

        let instructions = engine.evaluate(&event("p1", "purchase", json!({"amount": 10})));
        let by_token: BTreeMap<_, _> = instructions
            .iter()
            .map(|i| (i.token.as_str(), i.amount))
            .collect();

        assert_eq!(by_token["tgem"], 13);
        assert_eq!(by_token["partner"], 15);
    }

    #[test]
    fn test_when_conditions() {
        let engine = engine(
            r#"{"rules":[{"event_type":"quest_complete","rewards":[
                {"token":"tgem","kind":"credit","amount":{"type":"fixed","value":25}},
                {"token":"partner","kind":"credit","amount":{"type":"fixed","value":1},
                 "when":{"questId":"q-bonus"}}
            ]}]}"#,
        );

        let plain = engine.evaluate(&event("p1", "quest_complete", json!({"questId": "q1"})));
        assert_eq!(plain.len(), 1);

        let bonus = engine.evaluate(&event(
            "p1",
            "quest_complete",
            json!({"questId": "q-bonus"}),
        ));
        assert_eq!(bonus.len(), 2);
    }

    #[test]
    fn test_offsetting_rewards_dropped() {
        let engine = engine(
            r#"{"rules":[{"event_type":"swap","rewards":[
                {"token":"tgem","kind":"credit","amount":{"type":"fixed","value":3}},
                {"token":"tgem","kind":"debit","amount":{"type":"fixed","value":3}}
            ]}]}"#,
        );

        assert!(engine.evaluate(&event("p1", "swap", json!({}))).is_empty());
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let engine = RuleEngine::builtin().unwrap();
        let e = event("p1", "purchase", json!({"amount": 42}));
        assert_eq!(engine.evaluate(&e), engine.evaluate(&e));
    }

    #[test]
    fn test_daily_login_claims_its_utc_day() {
        let engine = RuleEngine::builtin().unwrap();
        let mut login = event("p1", "daily_login", json!({}));
        login.received_at = chrono::DateTime::parse_from_rfc3339("2026-10-19T22:30:00-03:00")
            .unwrap()
            .with_timezone(&Utc);

        let claim = engine.claim_for(&login).unwrap();
        assert_eq!(claim.event_type.as_str(), "daily_login");
        assert_eq!(claim.user_id.as_str(), "u1");
        assert_eq!(claim.window_start.to_string(), "2026-10-20");

        let purchase = event("p1", "purchase", json!({"amount": 3}));
        assert!(engine.claim_for(&purchase).is_none());
        assert!(engine.claim_for(&event("p1", "page_view", json!({}))).is_none());
    }

    #[test]
    fn test_project_override_decides_window() {
        let engine = engine(
            r#"{"rules":[
                {"event_type":"daily_login","once_per":"day","rewards":[
                    {"token":"tgem","kind":"credit","amount":{"type":"fixed","value":5}}]},
                {"project_key":"p2","event_type":"daily_login","rewards":[
                    {"token":"tgem","kind":"credit","amount":{"type":"fixed","value":1}}]}
            ]}"#,
        );

        assert!(engine.claim_for(&event("p1", "daily_login", json!({}))).is_some());
        assert!(engine.claim_for(&event("p2", "daily_login", json!({}))).is_none());
    }

    #[test]
    fn test_unlisted_token_forbids_overdraft() {
        let engine = engine(r#"{"tokens":{"credits":{"allow_overdraft":true}},"rules":[]}"#);
        assert!(engine.allows_overdraft(&Token::from("credits")));
        assert!(!engine.allows_overdraft(&Token::tgem()));
    }
}
