use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    manager::{ManagerError, ResourceManager},
    plan::{item_as_resource, ResourceItem},
    registry::ResourceType,
};

/// A declared resource plus the manager that reconciles it against the
/// service. `Output` stays `None` until the resource has been ensured present.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct Resource<Input, Output> {
    pub resource_type: ResourceType,
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub input: Input,
    pub output: Option<Output>,
    pub state: ResourceState,
    pub dependencies: HashSet<String>,
    #[serde(skip, default = "default_bindings")]
    pub bindings: Vec<Bind<Input>>,
    #[serde(skip, default = "default_manager")]
    pub manager: Option<Arc<dyn ResourceManager<Input, Output>>>,
}

pub fn default_manager<Input, Output>() -> Option<Arc<dyn ResourceManager<Input, Output>>> {
    None
}
pub fn default_bindings<Input>() -> Vec<Bind<Input>> {
    vec![]
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum ResourceState {
    Absent,
    #[default]
    Present,
}

/// Copies a dependency's output into this resource's input right before the
/// manager runs, once the dependency's output exists.
#[derive(Clone)]
#[allow(clippy::type_complexity)]
pub struct Bind<Input> {
    dep_id: String,
    dep_fn: Arc<dyn Fn(&mut Input) -> Result<(), ResourceError>>,
}

impl<T: fmt::Debug> fmt::Debug for Bind<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bind").field("dep_id", &self.dep_id).finish()
    }
}

impl<Input: fmt::Debug, Output: fmt::Debug> fmt::Debug for Resource<Input, Output> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("resource_type", &self.resource_type)
            .field("id", &self.id)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("state", &self.state)
            .field("dependencies", &self.dependencies)
            .field("bindings", &self.bindings)
            .finish()
    }
}

impl<Input: Clone + 'static, Output: Clone + 'static> Resource<Input, Output> {
    pub fn new(
        resource_type: ResourceType,
        manager: Arc<dyn ResourceManager<Input, Output>>,
        id: impl ToString,
        input: Input,
        state: ResourceState,
    ) -> Self {
        let name = id.to_string();
        let id = format!(
            "{}/{}/{}/{}",
            resource_type.rprovider.name,
            resource_type.rprovider.region,
            resource_type.rtype.name,
            &name
        );
        println!("New Resource[{}]", id);
        Self {
            id,
            name,
            resource_type,
            input,
            output: Default::default(),
            state,
            dependencies: Default::default(),
            bindings: Default::default(),
            manager: Some(manager),
        }
    }

    fn ensure_present(
        &mut self,
        latest: Option<Arc<dyn ResourceItem>>,
    ) -> Result<(), ResourceError> {
        let latest_output =
            latest.and_then(|latest| item_as_resource::<Input, Output>(latest.as_ref()).output);
        let manager = self.manager.as_ref().ok_or(ResourceError::ManagerNotSet)?;
        println!("Ensuring Resource[{}] is present", self.id);
        let output = manager.ensure_present(latest_output.as_ref(), &mut self.input)?;
        println!("Resource[{}] is present", self.id);
        self.output = Some(output);
        Ok(())
    }

    fn ensure_absent(&mut self) -> Result<bool, ResourceError> {
        let output = match self.output.as_ref() {
            Some(output) => output,
            None => return Ok(false),
        };
        let manager = self.manager.as_ref().ok_or(ResourceError::ManagerNotSet)?;
        println!("Ensuring Resource[{}] is absent", self.id);
        let deleted = manager.ensure_absent(output)?;
        println!("Resource[{}] is absent", self.id);
        Ok(deleted)
    }

    fn apply_bindings(&mut self) -> Result<(), ResourceError> {
        let mut input = self.input.clone();
        for b in self.bindings.iter() {
            (b.dep_fn)(&mut input)?;
            println!(
                "Bound Resource[{}].output into Resource[{}].input",
                b.dep_id, self.id
            );
        }
        self.input = input;
        Ok(())
    }
}

/// Shared handle over a [`Resource`]; this is what plans and bindings hold.
#[derive(Debug, Clone)]
pub struct SharedResource<Input: Clone, Output: Clone> {
    pub resource: Arc<Mutex<Resource<Input, Output>>>,
}

impl<Input: Clone + 'static, Output: Clone + 'static> SharedResource<Input, Output> {
    pub fn new_resource(
        resource_type: ResourceType,
        manager: Arc<dyn ResourceManager<Input, Output>>,
        id: impl ToString,
        input: Input,
        state: ResourceState,
    ) -> Self {
        Self::new(Resource::new(resource_type, manager, id, input, state))
    }

    pub fn new(resource: Resource<Input, Output>) -> Self {
        Self {
            resource: Arc::new(Mutex::new(resource)),
        }
    }

    /// Declares `dependency` as a prerequisite and registers `bind_fn` to run
    /// against this resource's input once the dependency's output is ready.
    pub fn bind<I2: 'static + Clone, O2: 'static + Clone>(
        &self,
        dependency: &SharedResource<I2, O2>,
        bind_fn: impl Fn(&mut Input, &O2) + 'static,
    ) -> Result<(), ResourceError> {
        let dep = dependency.clone();
        let other_id = dep.id()?;
        let other_state = dep.state()?;
        let mut inner = self.lock()?;
        inner.dependencies.insert(other_id.clone());
        println!("Binding Output[{}] to Input[{}]", other_id, inner.id);
        if let ResourceState::Absent = other_state {
            // A resource cannot outlive something it depends on.
            inner.state = ResourceState::Absent;
            println!("Resource[{}] marked absent with its dependency", inner.id);
        }
        inner.bindings.push(Bind {
            dep_id: other_id,
            dep_fn: Arc::new(move |input: &mut Input| {
                dep.with_output(|output| bind_fn(input, output))
            }),
        });
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<Resource<Input, Output>>, ResourceError> {
        self.resource
            .lock()
            .map_err(|err| ResourceError::LockFail(err.to_string()))
    }

    pub fn id(&self) -> Result<String, ResourceError> {
        self.lock().map(|inner| inner.id.clone())
    }
    pub fn state(&self) -> Result<ResourceState, ResourceError> {
        self.lock().map(|inner| inner.state.clone())
    }
    pub fn output(&self) -> Result<Option<Output>, ResourceError> {
        Ok(self.lock()?.output.clone())
    }

    pub fn with_output(&self, mut apply: impl FnMut(&Output)) -> Result<(), ResourceError> {
        self.lock().and_then(|inner| match &inner.output {
            Some(output) => {
                apply(output);
                Ok(())
            }
            None => Err(ResourceError::DependencyOutputIsMissing(
                inner.id.clone(),
            )),
        })
    }
}

impl<Input: Clone + 'static + fmt::Debug, Output: Clone + 'static + fmt::Debug> ResourceItem
    for SharedResource<Input, Output>
{
    fn id(&self) -> String {
        self.resource.lock().unwrap().id.clone()
    }
    fn name(&self) -> String {
        self.resource.lock().unwrap().name.clone()
    }
    fn resource_type(&self) -> ResourceType {
        self.resource.lock().unwrap().resource_type.clone()
    }
    fn state(&self) -> ResourceState {
        self.resource.lock().unwrap().state.clone()
    }
    fn set_state(&self, state: ResourceState) {
        self.resource.lock().unwrap().state = state;
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn dependencies(&self) -> HashSet<String> {
        self.resource.lock().unwrap().dependencies.clone()
    }
    fn ensure_present(&self, latest: Option<Arc<dyn ResourceItem>>) -> Result<(), ResourceError> {
        self.resource.lock().unwrap().ensure_present(latest)
    }
    fn ensure_absent(&self) -> Result<bool, ResourceError> {
        self.resource.lock().unwrap().ensure_absent()
    }
    fn apply_bindings(&self) -> Result<(), ResourceError> {
        self.resource.lock().unwrap().apply_bindings()
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("LockFail: {0}")]
    LockFail(String),
    #[error("Dependency output of {0} is not ready")]
    DependencyOutputIsMissing(String),
    #[error("Resource has no manager attached")]
    ManagerNotSet,
    #[error(transparent)]
    ManagerError(#[from] ManagerError),
}
