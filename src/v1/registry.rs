use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{
    manager::ResourceManager,
    plan::ResourceItem,
    resource::{Resource, SharedResource},
};

#[derive(Debug, Default, Clone, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct RProvider {
    pub name: String,
    pub region: String,
}

#[derive(Debug, Default, Clone, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct RType {
    pub name: String,
}

#[derive(Debug, Default, Clone, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct ResourceType {
    pub rprovider: RProvider,
    pub rtype: RType,
}

type Serializer = Arc<dyn Fn(&dyn ResourceItem) -> Result<Value, RegistryError>>;
type Deserializer = Arc<dyn Fn(&Value) -> Result<Arc<dyn ResourceItem>, RegistryError>>;

/// Serialize/deserialize pair for one resource type; deserialization
/// re-attaches the live manager so revived resources can reconcile again.
pub struct ResourceSerde {
    serializer: Serializer,
    deserializer: Deserializer,
}

pub trait ResourceSerdeProvider {
    fn get_resource_serde(
        &self,
        registry: &Registry,
        rt: &ResourceType,
    ) -> Result<ResourceSerde, RegistryError>;
}

pub type ProviderFactory =
    Box<dyn Fn(&RProvider) -> Result<Arc<Mutex<dyn ResourceSerdeProvider>>, RegistryError>>;

#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl SharedRegistry {
    pub fn new(provider_factory: ProviderFactory) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::new(provider_factory))),
        }
    }

    pub fn serialize_resource(
        &self,
        resource: &dyn ResourceItem,
        resource_type: &ResourceType,
    ) -> Result<Value, RegistryError> {
        self.inner
            .lock()
            .unwrap()
            .serialize_resource(resource, resource_type)
    }

    pub fn deserialize_resource(
        &self,
        value: &Value,
        resource_type: &ResourceType,
    ) -> Result<Arc<dyn ResourceItem>, RegistryError> {
        self.inner
            .lock()
            .unwrap()
            .deserialize_resource(value, resource_type)
    }
}

/// Resolves `(provider, region, type)` to the serde pair for that resource
/// type, creating providers and registering types lazily as state entries
/// reference them.
pub struct Registry {
    serde_store: HashMap<ResourceType, ResourceSerde>,
    provider_store: HashMap<RProvider, Arc<Mutex<dyn ResourceSerdeProvider>>>,
    provider_factory: ProviderFactory,
}

impl Registry {
    pub fn new(provider_factory: ProviderFactory) -> Self {
        Self {
            serde_store: HashMap::new(),
            provider_store: HashMap::new(),
            provider_factory,
        }
    }

    pub fn serde<Input, Output>(
        &self,
        manager: Arc<dyn ResourceManager<Input, Output>>,
    ) -> Result<ResourceSerde, RegistryError>
    where
        Input: 'static + Serialize + for<'de> Deserialize<'de> + Clone + fmt::Debug,
        Output: 'static + Serialize + for<'de> Deserialize<'de> + Clone + fmt::Debug,
    {
        let serializer: Serializer = Arc::new(
            move |item: &dyn ResourceItem| -> Result<Value, RegistryError> {
                let resource: Resource<Input, Output> = item
                    .as_any()
                    .downcast_ref::<SharedResource<Input, Output>>()
                    .ok_or(RegistryError::DowncastError)?
                    .resource
                    .lock()
                    .map_err(|_| RegistryError::LockResourceError)?
                    .clone();
                serde_json::to_value(resource).map_err(RegistryError::SerializationError)
            },
        );
        let deserializer: Deserializer = Arc::new(
            move |value: &Value| -> Result<Arc<dyn ResourceItem>, RegistryError> {
                let mut resource: Resource<Input, Output> =
                    serde_json::from_value(value.clone())
                        .map_err(RegistryError::SerializationError)?;
                resource.manager = Some(manager.clone());
                Ok(Arc::new(SharedResource::new(resource)) as Arc<dyn ResourceItem>)
            },
        );
        Ok(ResourceSerde {
            serializer,
            deserializer,
        })
    }

    pub fn serialize_resource(
        &mut self,
        resource: &dyn ResourceItem,
        resource_type: &ResourceType,
    ) -> Result<Value, RegistryError> {
        self.ensure_type_is_registered(resource_type)?;
        (self.serde_store[resource_type].serializer)(resource)
    }

    pub fn deserialize_resource(
        &mut self,
        value: &Value,
        resource_type: &ResourceType,
    ) -> Result<Arc<dyn ResourceItem>, RegistryError> {
        self.ensure_type_is_registered(resource_type)?;
        (self.serde_store[resource_type].deserializer)(value)
    }

    fn ensure_type_is_registered(
        &mut self,
        resource_type: &ResourceType,
    ) -> Result<(), RegistryError> {
        if self.serde_store.contains_key(resource_type) {
            return Ok(());
        }
        self.ensure_provider_is_registered(&resource_type.rprovider)?;
        let serde = self.provider_store[&resource_type.rprovider]
            .lock()
            .unwrap()
            .get_resource_serde(self, resource_type)?;
        self.serde_store.insert(resource_type.clone(), serde);
        Ok(())
    }

    fn ensure_provider_is_registered(
        &mut self,
        rprovider: &RProvider,
    ) -> Result<(), RegistryError> {
        if !self.provider_store.contains_key(rprovider) {
            let provider = (self.provider_factory)(rprovider)?;
            self.provider_store.insert(rprovider.clone(), provider);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Could not downcast item to its typed resource")]
    DowncastError,
    #[error("Could not lock resource")]
    LockResourceError,
    #[error("No provider registered under {0}")]
    ProviderNotFound(String),
    #[error("Resource type {0} is not supported")]
    ResourceTypeNotSupported(String),
    #[error("Could not serialize or deserialize resource: {0}")]
    SerializationError(#[from] serde_json::Error),
}
