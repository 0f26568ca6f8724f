use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AdmissionService, CounterKind, CounterSnapshot, Limit, LIMIT_UNLIMITED};
use crate::core::error::AdmissionError;
use crate::core::tags::{KeyValues, TagQuery};

/// A limit on the aggregate of one counter kind over every tag set that
/// contains `selection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub counter: CounterKind,
    #[serde(default)]
    pub selection: KeyValues,
    pub limit: i64,
}

/// Replaces the limit of rule `rule` for tag sets containing `tags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub rule: String,
    #[serde(default)]
    pub tags: KeyValues,
    pub limit: i64,
}

impl Override {
    fn scope(&self, rule: &Rule) -> KeyValues {
        let mut selection = rule.selection.clone();
        for (k, v) in self.tags.iter() {
            selection.insert(k.clone(), v.clone());
        }
        selection
    }
}

/// In-process admission service backed by `dashmap` counters.
#[derive(Debug, Default)]
pub struct LocalAdmission {
    counters: DashMap<(KeyValues, CounterKind), i64>,
    rules: RwLock<Vec<Rule>>,
    overrides: RwLock<Vec<Override>>,
    // Serializes check-then-add so two increments can't both squeeze under a limit.
    update_gate: Mutex<()>,
    unavailable: AtomicBool,
}

impl LocalAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<Rule>, overrides: Vec<Override>) -> Self {
        let admission = Self::new();
        *admission.rules.write() = rules;
        *admission.overrides.write() = overrides;
        admission
    }

    /// Adds a rule, replacing any rule with the same name.
    pub fn set_rule(&self, rule: Rule) {
        info!(rule = %rule.name, limit = rule.limit, "admission rule set");
        let mut rules = self.rules.write();
        rules.retain(|r| r.name != rule.name);
        rules.push(rule);
    }

    /// Removes a rule and its overrides. Returns false if no such rule existed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        self.overrides.write().retain(|o| o.rule != name);
        let removed = rules.len() != before;
        if removed {
            info!(rule = %name, "admission rule removed");
        }
        removed
    }

    /// Adds an override, replacing one with the same rule and tags.
    pub fn set_override(&self, over: Override) {
        let mut overrides = self.overrides.write();
        overrides.retain(|o| !(o.rule == over.rule && o.tags == over.tags));
        overrides.push(over);
    }

    /// Makes every call fail with a transport error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current value of one counter for an exact tag set.
    pub fn counter(&self, tags: &KeyValues, counter: CounterKind) -> i64 {
        self.counters
            .get(&(tags.clone(), counter))
            .map(|v| *v)
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), AdmissionError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AdmissionError::Transport(
                "admission service unavailable".into(),
            ));
        }
        Ok(())
    }

    /// Limits that apply to `tags`, overrides taking precedence over the
    /// rule they belong to. The most specific override wins.
    fn effective_limits(&self, tags: &KeyValues, counter: Option<CounterKind>) -> Vec<Limit> {
        let rules = self.rules.read();
        let overrides = self.overrides.read();
        rules
            .iter()
            .filter(|r| counter.map_or(true, |c| r.counter == c))
            .filter(|r| tags.contains_all(&r.selection))
            .map(|rule| {
                let over = overrides
                    .iter()
                    .filter(|o| o.rule == rule.name && tags.contains_all(&o.tags))
                    .max_by_key(|o| o.tags.len());
                match over {
                    Some(o) => Limit {
                        rule: rule.name.clone(),
                        counter: rule.counter,
                        selection: o.scope(rule),
                        limit: o.limit,
                    },
                    None => Limit {
                        rule: rule.name.clone(),
                        counter: rule.counter,
                        selection: rule.selection.clone(),
                        limit: rule.limit,
                    },
                }
            })
            .collect()
    }

    fn aggregate(&self, selection: &KeyValues, counter: CounterKind) -> i64 {
        self.counters
            .iter()
            .filter(|e| e.key().1 == counter && e.key().0.contains_all(selection))
            .map(|e| *e.value())
            .sum()
    }
}

#[async_trait]
impl AdmissionService for LocalAdmission {
    async fn update_counter(
        &self,
        tags: &KeyValues,
        counter: CounterKind,
        delta: i64,
    ) -> Result<(), AdmissionError> {
        self.check_available()?;
        let _gate = self.update_gate.lock();

        if delta > 0 {
            for limit in self.effective_limits(tags, Some(counter)) {
                if limit.limit <= LIMIT_UNLIMITED {
                    continue;
                }
                let current = self.aggregate(&limit.selection, counter);
                if current + delta > limit.limit {
                    debug!(%tags, ?counter, rule = %limit.rule, current, limit = limit.limit, "limit reached");
                    return Err(AdmissionError::LimitReached {
                        rule: limit.rule,
                        limit: limit.limit,
                    });
                }
            }
        }

        let mut value = self.counters.entry((tags.clone(), counter)).or_insert(0);
        *value = (*value + delta).max(0);
        Ok(())
    }

    async fn set_counters(&self, tags: &KeyValues, value: i64) -> Result<(), AdmissionError> {
        self.check_available()?;
        let _gate = self.update_gate.lock();
        for counter in [CounterKind::Enqueued, CounterKind::Running] {
            self.counters.insert((tags.clone(), counter), value.max(0));
        }
        Ok(())
    }

    async fn match_rules(&self, tags: &KeyValues) -> Result<Vec<Limit>, AdmissionError> {
        self.check_available()?;
        let rules = self.rules.read();
        Ok(rules
            .iter()
            .filter(|r| tags.contains_all(&r.selection))
            .map(|r| Limit {
                rule: r.name.clone(),
                counter: r.counter,
                selection: r.selection.clone(),
                limit: r.limit,
            })
            .collect())
    }

    async fn match_overrides(&self, tags: &KeyValues) -> Result<Vec<Limit>, AdmissionError> {
        self.check_available()?;
        Ok(self
            .effective_limits(tags, None)
            .into_iter()
            .filter(|limit| {
                self.overrides
                    .read()
                    .iter()
                    .any(|o| o.rule == limit.rule && tags.contains_all(&o.tags))
            })
            .collect())
    }

    async fn query_counters(
        &self,
        query: &TagQuery,
        counter: CounterKind,
    ) -> Result<Vec<CounterSnapshot>, AdmissionError> {
        self.check_available()?;
        Ok(self
            .counters
            .iter()
            .filter(|e| e.key().1 == counter && query.matches(&e.key().0))
            .map(|e| CounterSnapshot {
                tags: e.key().0.clone(),
                counter,
                value: *e.value(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_rule(name: &str, selection: KeyValues, limit: i64) -> Rule {
        Rule {
            name: name.into(),
            counter: CounterKind::Running,
            selection,
            limit,
        }
    }

    #[tokio::test]
    async fn rejection_leaves_counters_untouched() {
        let admission = LocalAdmission::new();
        admission.set_rule(running_rule("one-at-a-time", KeyValues::new(), 1));
        let tags = KeyValues::new().with("a", "1");

        admission
            .update_counter(&tags, CounterKind::Running, 1)
            .await
            .unwrap();
        let err = admission
            .update_counter(&tags, CounterKind::Running, 1)
            .await
            .unwrap_err();

        assert!(matches!(err, AdmissionError::LimitReached { limit: 1, .. }));
        assert_eq!(admission.counter(&tags, CounterKind::Running), 1);
        // Other counter kinds are not governed by the rule.
        admission
            .update_counter(&tags, CounterKind::Enqueued, 5)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn limits_aggregate_over_selection() {
        let admission = LocalAdmission::new();
        let tenant = KeyValues::new().with("tenant", "t1");
        admission.set_rule(running_rule("tenant", tenant.clone(), 2));

        let a = tenant.clone().with("job", "a");
        let b = tenant.clone().with("job", "b");
        let other = KeyValues::new().with("tenant", "t2");

        admission.update_counter(&a, CounterKind::Running, 1).await.unwrap();
        admission.update_counter(&b, CounterKind::Running, 1).await.unwrap();
        assert!(admission.update_counter(&a, CounterKind::Running, 1).await.is_err());
        admission.update_counter(&other, CounterKind::Running, 3).await.unwrap();
    }

    #[tokio::test]
    async fn zero_blocks_and_minus_one_is_unlimited() {
        let admission = LocalAdmission::new();
        let tags = KeyValues::new().with("a", "1");
        admission.set_rule(running_rule("closed", KeyValues::new(), 0));
        assert!(admission.update_counter(&tags, CounterKind::Running, 1).await.is_err());

        admission.set_override(Override {
            rule: "closed".into(),
            tags: tags.clone(),
            limit: -1,
        });
        admission.update_counter(&tags, CounterKind::Running, 100).await.unwrap();

        let overrides = admission.match_overrides(&tags).await.unwrap();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].limit, -1);
        assert_eq!(admission.match_rules(&tags).await.unwrap()[0].limit, 0);
    }

    #[tokio::test]
    async fn decrements_clamp_at_zero() {
        let admission = LocalAdmission::new();
        let tags = KeyValues::new().with("a", "1");
        admission.update_counter(&tags, CounterKind::Enqueued, -3).await.unwrap();
        assert_eq!(admission.counter(&tags, CounterKind::Enqueued), 0);

        admission.set_counters(&tags, 7).await.unwrap();
        assert_eq!(admission.counter(&tags, CounterKind::Running), 7);
        let snapshot = admission
            .query_counters(&TagQuery::Subset(KeyValues::new().with("a", "1")), CounterKind::Running)
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].value, 7);
    }

    #[tokio::test]
    async fn unavailable_service_fails_every_call() {
        let admission = LocalAdmission::new();
        let tags = KeyValues::new().with("a", "1");
        admission.set_unavailable(true);
        assert!(matches!(
            admission.update_counter(&tags, CounterKind::Running, 1).await,
            Err(AdmissionError::Transport(_))
        ));
        assert!(admission.match_rules(&tags).await.is_err());

        admission.set_unavailable(false);
        assert!(admission.update_counter(&tags, CounterKind::Running, 1).await.is_ok());
    }

    #[tokio::test]
    async fn removing_a_rule_drops_its_overrides() {
        let admission = LocalAdmission::new();
        admission.set_rule(running_rule("r", KeyValues::new(), 0));
        admission.set_override(Override {
            rule: "r".into(),
            tags: KeyValues::new(),
            limit: 5,
        });
        assert!(admission.remove_rule("r"));
        assert!(!admission.remove_rule("r"));
        assert!(admission.match_overrides(&KeyValues::new()).await.unwrap().is_empty());
    }
}
