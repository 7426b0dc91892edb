use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::runtime::Handle;

use super::{
    aws::WafProvider,
    plan::{PlanError, SharedPlan},
    registry::{RProvider, RegistryError, ResourceSerdeProvider, SharedRegistry},
    state::{StateError, StateStore},
};

/// Owns the plan, the state store and the type registry, and drives
/// apply/destroy runs end to end.
#[derive(Default)]
pub struct WafCloud {
    plan: SharedPlan,
    state: StateStore,
    registry: Option<SharedRegistry>,
}

impl WafCloud {
    pub fn init_registry(&mut self, handle: Handle) {
        let plan = self.plan.clone();
        self.registry = Some(SharedRegistry::new(Box::new(
            move |r| -> Result<Arc<Mutex<dyn ResourceSerdeProvider>>, RegistryError> {
                if r.name != "aws" {
                    return Err(RegistryError::ProviderNotFound(r.name.clone()));
                }
                Ok(Arc::new(Mutex::new(WafProvider::new(
                    &handle,
                    plan.clone(),
                    r.clone(),
                ))) as Arc<Mutex<dyn ResourceSerdeProvider>>)
            },
        )));
    }

    pub fn waf_provider(&self, handle: Handle, region: impl ToString) -> WafProvider {
        WafProvider::new(
            &handle,
            self.plan.clone(),
            RProvider {
                name: "aws".to_string(),
                region: region.to_string(),
            },
        )
    }

    pub fn apply(&mut self) -> Result<(), CloudError> {
        self.state.reload()?;
        let result = match self.registry.as_ref() {
            Some(registry) => self.plan.apply(&mut self.state, registry).map_err(CloudError::from),
            None => Err(CloudError::RegistryNotInitialized),
        };
        self.state.save()?;
        result
    }

    pub fn destroy(&mut self) -> Result<(), CloudError> {
        self.state.reload()?;
        let result = match self.registry.as_ref() {
            Some(registry) => self
                .plan
                .destroy(&mut self.state, registry)
                .map_err(CloudError::from),
            None => Err(CloudError::RegistryNotInitialized),
        };
        self.state.save()?;
        result
    }
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error(transparent)]
    PlanError(#[from] PlanError),
    #[error(transparent)]
    StateError(#[from] StateError),
    #[error("Registry not initialized")]
    RegistryNotInitialized,
}
