use std::sync::Arc;

use aws_sdk_wafregional::types::{
    ChangeAction, IpSet as AwsIpSet, IpSetDescriptor, IpSetDescriptorType, IpSetUpdate,
};
use serde::{Deserialize, Serialize};

use super::{is_not_found, set_updates, stale_data};
use crate::v1::{
    aws::{WafEnv, WafManager, WafResource, WafResourceCreator, WafType},
    manager::{ManagerError, ResourceManager},
};

pub type IpSetInput = SerializableIpSetInput;
pub type IpSetOutput = SerializableIpSetOutput;
pub type IpSetManager = WafManager<IpSetInput, IpSetOutput>;
pub type IpSet<'a> = WafResource<'a, IpSetInput, IpSetOutput>;

impl WafResourceCreator for IpSet<'_> {
    type Input = IpSetInput;
    type Output = IpSetOutput;

    fn r#type() -> WafType {
        WafType::IpSet
    }

    fn manager(env: &WafEnv) -> Arc<dyn ResourceManager<Self::Input, Self::Output>> {
        IpSetManager::new(env).arc()
    }

    fn input_hook(id: &str, input: &mut Self::Input) {
        if input.name.is_none() {
            input.name = Some(id.to_owned());
        }
    }
}

impl ResourceManager<IpSetInput, IpSetOutput> for IpSetManager {
    fn lookup(&self, latest: &IpSetOutput) -> Result<Option<IpSetOutput>, ManagerError> {
        self.get(&latest.ip_set_id)
    }

    fn lookup_by_input(&self, input: &IpSetInput) -> Result<Option<IpSetOutput>, ManagerError> {
        match input.name.as_deref() {
            Some(name) => self.find_by_name(name),
            None => Ok(None),
        }
    }

    fn create(&self, input: &mut IpSetInput) -> Result<IpSetOutput, ManagerError> {
        let name = input.name.clone().ok_or_else(|| {
            ManagerError::CreateFail("IP set name is not present".to_string())
        })?;
        let created = self.create_ip_set(&name)?;
        let inserts = input
            .descriptors
            .iter()
            .map(|d| d.to_update(ChangeAction::Insert))
            .collect::<Result<Vec<_>, _>>()?;
        self.apply_updates(&created.ip_set_id, inserts)?;
        self.get(&created.ip_set_id)?.ok_or_else(|| {
            ManagerError::CreateFail("could not read back the created IP set".to_string())
        })
    }

    fn delete(&self, latest: &IpSetOutput) -> Result<bool, ManagerError> {
        self.delete_ip_set(latest)
    }

    fn syncup(
        &self,
        latest: &IpSetOutput,
        input: &mut IpSetInput,
    ) -> Result<Option<IpSetOutput>, ManagerError> {
        let (inserts, deletes) = set_updates(&latest.descriptors, &input.descriptors);
        if inserts.is_empty() && deletes.is_empty() {
            return Ok(None);
        }
        let mut updates = Vec::with_capacity(inserts.len() + deletes.len());
        for descriptor in inserts {
            updates.push(descriptor.to_update(ChangeAction::Insert)?);
        }
        for descriptor in deletes {
            updates.push(descriptor.to_update(ChangeAction::Delete)?);
        }
        self.apply_updates(&latest.ip_set_id, updates)?;
        self.get(&latest.ip_set_id)
    }
}

impl IpSetManager {
    fn get(&self, ip_set_id: &str) -> Result<Option<IpSetOutput>, ManagerError> {
        let resp = self
            .handle
            .block_on(async { self.client.get_ip_set().ip_set_id(ip_set_id).send().await });
        match resp {
            Ok(out) => Ok(out.ip_set.as_ref().map(IpSetOutput::from)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(ManagerError::LookupFail(format!("{:?}", e.into_source()))),
        }
    }

    fn find_by_name(&self, name: &str) -> Result<Option<IpSetOutput>, ManagerError> {
        let mut marker: Option<String> = None;
        loop {
            let out = self
                .handle
                .block_on(async {
                    self.client
                        .list_ip_sets()
                        .set_next_marker(marker.clone())
                        .limit(100)
                        .send()
                        .await
                })
                .map_err(|e| ManagerError::LookupFail(format!("{:?}", e.into_source())))?;
            if let Some(summary) = out.ip_sets().iter().find(|s| s.name() == name) {
                return self.get(summary.ip_set_id());
            }
            marker = out.next_marker;
            if marker.is_none() {
                return Ok(None);
            }
        }
    }

    fn create_ip_set(&self, name: &str) -> Result<IpSetOutput, ManagerError> {
        let client = self.client.clone();
        let name = name.to_owned();
        let out = self
            .handle
            .block_on(async {
                self.retryer()
                    .retry_with_token(&self.cancel, stale_data, move |token| {
                        let client = client.clone();
                        let name = name.clone();
                        async move {
                            client
                                .create_ip_set()
                                .name(name)
                                .change_token(token)
                                .send()
                                .await
                        }
                    })
                    .await
            })
            .map_err(|e| ManagerError::CreateFail(format!("{:?}", e)))?;
        out.ip_set
            .as_ref()
            .map(IpSetOutput::from)
            .ok_or_else(|| ManagerError::CreateFail("service returned no IP set".to_string()))
    }

    fn apply_updates(
        &self,
        ip_set_id: &str,
        updates: Vec<IpSetUpdate>,
    ) -> Result<(), ManagerError> {
        if updates.is_empty() {
            return Ok(());
        }
        let client = self.client.clone();
        let ip_set_id = ip_set_id.to_owned();
        self.handle
            .block_on(async {
                self.retryer()
                    .retry_with_token(&self.cancel, stale_data, move |token| {
                        let client = client.clone();
                        let ip_set_id = ip_set_id.clone();
                        let updates = updates.clone();
                        async move {
                            client
                                .update_ip_set()
                                .ip_set_id(ip_set_id)
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

    fn delete_ip_set(&self, latest: &IpSetOutput) -> Result<bool, ManagerError> {
        // The service refuses to delete a non-empty IP set.
        let deletes = latest
            .descriptors
            .iter()
            .map(|d| d.to_update(ChangeAction::Delete))
            .collect::<Result<Vec<_>, _>>()?;
        self.apply_updates(&latest.ip_set_id, deletes)?;
        let client = self.client.clone();
        let ip_set_id = latest.ip_set_id.clone();
        self.handle
            .block_on(async {
                self.retryer()
                    .retry_with_token(&self.cancel, stale_data, move |token| {
                        let client = client.clone();
                        let ip_set_id = ip_set_id.clone();
                        async move {
                            client
                                .delete_ip_set()
                                .ip_set_id(ip_set_id)
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
pub struct SerializableIpSetInput {
    pub name: Option<String>,
    pub descriptors: Vec<SerializableIpSetDescriptor>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SerializableIpSetOutput {
    pub ip_set_id: String,
    pub name: Option<String>,
    pub descriptors: Vec<SerializableIpSetDescriptor>,
}

impl From<&AwsIpSet> for SerializableIpSetOutput {
    fn from(value: &AwsIpSet) -> Self {
        Self {
            ip_set_id: value.ip_set_id().to_string(),
            name: value.name().map(str::to_string),
            descriptors: value.ip_set_descriptors().iter().map(Into::into).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerializableIpSetDescriptor {
    pub r#type: SerializableIpSetDescriptorType,
    pub value: String,
}

impl SerializableIpSetDescriptor {
    fn to_update(&self, action: ChangeAction) -> Result<IpSetUpdate, ManagerError> {
        let descriptor = IpSetDescriptor::builder()
            .r#type(IpSetDescriptorType::from(&self.r#type))
            .value(&self.value)
            .build()
            .map_err(|e| ManagerError::UpdateFail(format!("{:?}", e)))?;
        IpSetUpdate::builder()
            .action(action)
            .ip_set_descriptor(descriptor)
            .build()
            .map_err(|e| ManagerError::UpdateFail(format!("{:?}", e)))
    }
}

impl From<&IpSetDescriptor> for SerializableIpSetDescriptor {
    fn from(value: &IpSetDescriptor) -> Self {
        Self {
            r#type: value.r#type().into(),
            value: value.value().to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum SerializableIpSetDescriptorType {
    Ipv4,
    Ipv6,
    Unknown,
}

impl From<&IpSetDescriptorType> for SerializableIpSetDescriptorType {
    fn from(value: &IpSetDescriptorType) -> Self {
        match value {
            IpSetDescriptorType::Ipv4 => Self::Ipv4,
            IpSetDescriptorType::Ipv6 => Self::Ipv6,
            _ => Self::Unknown,
        }
    }
}

impl From<&SerializableIpSetDescriptorType> for IpSetDescriptorType {
    fn from(value: &SerializableIpSetDescriptorType) -> Self {
        match value {
            SerializableIpSetDescriptorType::Ipv4 => IpSetDescriptorType::Ipv4,
            SerializableIpSetDescriptorType::Ipv6 => IpSetDescriptorType::Ipv6,
            SerializableIpSetDescriptorType::Unknown => IpSetDescriptorType::from("Unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_ip_set_maps_into_output() {
        let descriptor = IpSetDescriptor::builder()
            .r#type(IpSetDescriptorType::Ipv4)
            .value("192.0.2.0/24")
            .build()
            .unwrap();
        let ip_set = AwsIpSet::builder()
            .ip_set_id("abc123")
            .name("blocked-addresses")
            .ip_set_descriptors(descriptor)
            .build()
            .unwrap();
        let output = IpSetOutput::from(&ip_set);
        assert_eq!(output.ip_set_id, "abc123");
        assert_eq!(output.name.as_deref(), Some("blocked-addresses"));
        assert_eq!(
            output.descriptors,
            vec![SerializableIpSetDescriptor {
                r#type: SerializableIpSetDescriptorType::Ipv4,
                value: "192.0.2.0/24".to_string(),
            }]
        );
    }

    #[test]
    fn unnamed_ip_set_maps_with_no_name() {
        let ip_set = AwsIpSet::builder()
            .ip_set_id("abc123")
            .set_ip_set_descriptors(Some(Vec::new()))
            .build()
            .unwrap();
        let output = IpSetOutput::from(&ip_set);
        assert!(output.name.is_none());
        assert!(output.descriptors.is_empty());
    }
}
