use std::sync::Arc;

use aws_sdk_wafregional::types::{
    ChangeAction, Predicate, PredicateType, Rule as AwsRule, RuleUpdate,
};
use serde::{Deserialize, Serialize};

use super::{is_not_found, set_updates, stale_data};
use crate::v1::{
    aws::{WafEnv, WafManager, WafResource, WafResourceCreator, WafType},
    manager::{ManagerError, ResourceManager},
};

pub type RuleInput = SerializableRuleInput;
pub type RuleOutput = SerializableRuleOutput;
pub type RuleManager = WafManager<RuleInput, RuleOutput>;
pub type Rule<'a> = WafResource<'a, RuleInput, RuleOutput>;

impl WafResourceCreator for Rule<'_> {
    type Input = RuleInput;
    type Output = RuleOutput;

    fn r#type() -> WafType {
        WafType::Rule
    }

    fn manager(env: &WafEnv) -> Arc<dyn ResourceManager<Self::Input, Self::Output>> {
        RuleManager::new(env).arc()
    }

    fn input_hook(id: &str, input: &mut Self::Input) {
        if input.name.is_none() {
            input.name = Some(id.to_owned());
        }
    }
}

impl ResourceManager<RuleInput, RuleOutput> for RuleManager {
    fn lookup(&self, latest: &RuleOutput) -> Result<Option<RuleOutput>, ManagerError> {
        self.get(&latest.rule_id)
    }

    fn lookup_by_input(&self, input: &RuleInput) -> Result<Option<RuleOutput>, ManagerError> {
        match input.name.as_deref() {
            Some(name) => self.find_by_name(name),
            None => Ok(None),
        }
    }

    fn create(&self, input: &mut RuleInput) -> Result<RuleOutput, ManagerError> {
        let name = input
            .name
            .clone()
            .ok_or_else(|| ManagerError::CreateFail("rule name is not present".to_string()))?;
        let metric_name = input.metric_name.clone().ok_or_else(|| {
            ManagerError::CreateFail("rule metric name is not present".to_string())
        })?;
        let created = self.create_rule(&name, &metric_name)?;
        let inserts = input
            .predicates
            .iter()
            .map(|p| p.to_update(ChangeAction::Insert))
            .collect::<Result<Vec<_>, _>>()?;
        self.apply_updates(&created.rule_id, inserts)?;
        self.get(&created.rule_id)?.ok_or_else(|| {
            ManagerError::CreateFail("could not read back the created rule".to_string())
        })
    }

    fn delete(&self, latest: &RuleOutput) -> Result<bool, ManagerError> {
        self.delete_rule(latest)
    }

    fn syncup(
        &self,
        latest: &RuleOutput,
        input: &mut RuleInput,
    ) -> Result<Option<RuleOutput>, ManagerError> {
        let (inserts, deletes) = set_updates(&latest.predicates, &input.predicates);
        if inserts.is_empty() && deletes.is_empty() {
            return Ok(None);
        }
        let mut updates = Vec::with_capacity(inserts.len() + deletes.len());
        for predicate in inserts {
            updates.push(predicate.to_update(ChangeAction::Insert)?);
        }
        for predicate in deletes {
            updates.push(predicate.to_update(ChangeAction::Delete)?);
        }
        self.apply_updates(&latest.rule_id, updates)?;
        self.get(&latest.rule_id)
    }
}

impl RuleManager {
    fn get(&self, rule_id: &str) -> Result<Option<RuleOutput>, ManagerError> {
        let resp = self
            .handle
            .block_on(async { self.client.get_rule().rule_id(rule_id).send().await });
        match resp {
            Ok(out) => Ok(out.rule.as_ref().map(RuleOutput::from)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(ManagerError::LookupFail(format!("{:?}", e.into_source()))),
        }
    }

    fn find_by_name(&self, name: &str) -> Result<Option<RuleOutput>, ManagerError> {
        let mut marker: Option<String> = None;
        loop {
            let out = self
                .handle
                .block_on(async {
                    self.client
                        .list_rules()
                        .set_next_marker(marker.clone())
                        .limit(100)
                        .send()
                        .await
                })
                .map_err(|e| ManagerError::LookupFail(format!("{:?}", e.into_source())))?;
            if let Some(summary) = out.rules().iter().find(|s| s.name() == name) {
                return self.get(summary.rule_id());
            }
            marker = out.next_marker;
            if marker.is_none() {
                return Ok(None);
            }
        }
    }

    fn create_rule(&self, name: &str, metric_name: &str) -> Result<RuleOutput, ManagerError> {
        let client = self.client.clone();
        let name = name.to_owned();
        let metric_name = metric_name.to_owned();
        let out = self
            .handle
            .block_on(async {
                self.retryer()
                    .retry_with_token(&self.cancel, stale_data, move |token| {
                        let client = client.clone();
                        let name = name.clone();
                        let metric_name = metric_name.clone();
                        async move {
                            client
                                .create_rule()
                                .name(name)
                                .metric_name(metric_name)
                                .change_token(token)
                                .send()
                                .await
                        }
                    })
                    .await
            })
            .map_err(|e| ManagerError::CreateFail(format!("{:?}", e)))?;
        out.rule
            .as_ref()
            .map(RuleOutput::from)
            .ok_or_else(|| ManagerError::CreateFail("service returned no rule".to_string()))
    }

    fn apply_updates(&self, rule_id: &str, updates: Vec<RuleUpdate>) -> Result<(), ManagerError> {
        if updates.is_empty() {
            return Ok(());
        }
        let client = self.client.clone();
        let rule_id = rule_id.to_owned();
        self.handle
            .block_on(async {
                self.retryer()
                    .retry_with_token(&self.cancel, stale_data, move |token| {
                        let client = client.clone();
                        let rule_id = rule_id.clone();
                        let updates = updates.clone();
                        async move {
                            client
                                .update_rule()
                                .rule_id(rule_id)
                                .change_token(token)
                                .set_updates(Some(updates))
                                .send()
                                .await
                        }
                    })
                    .await
            })
            .map(|_| ())
            .map_err(|e| ManagerError::UpdateFail(format!("{:?}", e)))
    }

    fn delete_rule(&self, latest: &RuleOutput) -> Result<bool, ManagerError> {
        // A rule with predicates still attached cannot be deleted.
        let deletes = latest
            .predicates
            .iter()
            .map(|p| p.to_update(ChangeAction::Delete))
            .collect::<Result<Vec<_>, _>>()?;
        self.apply_updates(&latest.rule_id, deletes)?;
        let client = self.client.clone();
        let rule_id = latest.rule_id.clone();
        self.handle
            .block_on(async {
                self.retryer()
                    .retry_with_token(&self.cancel, stale_data, move |token| {
                        let client = client.clone();
                        let rule_id = rule_id.clone();
                        async move {
                            client
                                .delete_rule()
                                .rule_id(rule_id)
                                .change_token(token)
                                .send()
                                .await
                        }
                    })
                    .await
            })
            .map(|_| true)
            .map_err(|e| ManagerError::DeleteFail(format!("{:?}", e)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SerializableRuleInput {
    pub name: Option<String>,
    pub metric_name: Option<String>,
    pub predicates: Vec<SerializablePredicate>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SerializableRuleOutput {
    pub rule_id: String,
    pub name: Option<String>,
    pub metric_name: Option<String>,
    pub predicates: Vec<SerializablePredicate>,
}

impl From<&AwsRule> for SerializableRuleOutput {
    fn from(value: &AwsRule) -> Self {
        Self {
            rule_id: value.rule_id().to_string(),
            name: value.name().map(str::to_string),
            metric_name: value.metric_name().map(str::to_string),
            predicates: value.predicates().iter().map(Into::into).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerializablePredicate {
    pub negated: bool,
    pub r#type: SerializablePredicateType,
    pub data_id: String,
}

impl SerializablePredicate {
    fn to_update(&self, action: ChangeAction) -> Result<RuleUpdate, ManagerError> {
        let predicate = Predicate::builder()
            .negated(self.negated)
            .r#type(PredicateType::from(&self.r#type))
            .data_id(&self.data_id)
            .build()
            .map_err(|e| ManagerError::UpdateFail(format!("{:?}", e)))?;
        RuleUpdate::builder()
            .action(action)
            .predicate(predicate)
            .build()
            .map_err(|e| ManagerError::UpdateFail(format!("{:?}", e)))
    }
}

impl From<&Predicate> for SerializablePredicate {
    fn from(value: &Predicate) -> Self {
        Self {
            negated: value.negated(),
            r#type: value.r#type().into(),
            data_id: value.data_id().to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum SerializablePredicateType {
    ByteMatch,
    GeoMatch,
    IpMatch,
    RegexMatch,
    SizeConstraint,
    SqlInjectionMatch,
    XssMatch,
    Unknown,
}

impl From<&PredicateType> for SerializablePredicateType {
    fn from(value: &PredicateType) -> Self {
        match value {
            PredicateType::ByteMatch => Self::ByteMatch,
            PredicateType::GeoMatch => Self::GeoMatch,
            PredicateType::IpMatch => Self::IpMatch,
            PredicateType::RegexMatch => Self::RegexMatch,
            PredicateType::SizeConstraint => Self::SizeConstraint,
            PredicateType::SqlInjectionMatch => Self::SqlInjectionMatch,
            PredicateType::XssMatch => Self::XssMatch,
            _ => Self::Unknown,
        }
    }
}

impl From<&SerializablePredicateType> for PredicateType {
    fn from(value: &SerializablePredicateType) -> Self {
        match value {
            SerializablePredicateType::ByteMatch => PredicateType::ByteMatch,
            SerializablePredicateType::GeoMatch => PredicateType::GeoMatch,
            SerializablePredicateType::IpMatch => PredicateType::IpMatch,
            SerializablePredicateType::RegexMatch => PredicateType::RegexMatch,
            SerializablePredicateType::SizeConstraint => PredicateType::SizeConstraint,
            SerializablePredicateType::SqlInjectionMatch => PredicateType::SqlInjectionMatch,
            SerializablePredicateType::XssMatch => PredicateType::XssMatch,
            SerializablePredicateType::Unknown => PredicateType::from("Unknown"),
        }
    }
}
