use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex},
};

use daggy::{stable_dag::StableDag, NodeIndex};
use petgraph::algo::toposort;
use thiserror::Error;

use super::{
    manager::ResourceManager,
    registry::{ResourceType, SharedRegistry},
    resource::{Resource, ResourceError, ResourceState, SharedResource},
    state::{StateError, StateStore},
};

/// Type-erased view over a declared resource, so the plan can order and drive
/// resources of different Input/Output types together.
pub trait ResourceItem: fmt::Debug {
    fn as_any(&self) -> &dyn std::any::Any;
    fn resource_type(&self) -> ResourceType;
    fn id(&self) -> String;
    fn name(&self) -> String;
    fn state(&self) -> ResourceState;
    fn set_state(&self, state: ResourceState);
    fn dependencies(&self) -> HashSet<String>;
    fn ensure_present(&self, latest: Option<Arc<dyn ResourceItem>>) -> Result<(), ResourceError>;
    fn ensure_absent(&self) -> Result<bool, ResourceError>;
    fn apply_bindings(&self) -> Result<(), ResourceError>;
}

pub fn item_as_resource<Input: Clone + 'static, Output: Clone + 'static>(
    item: &dyn ResourceItem,
) -> Resource<Input, Output> {
    item.as_any()
        .downcast_ref::<SharedResource<Input, Output>>()
        .unwrap()
        .resource
        .lock()
        .unwrap()
        .clone()
}

#[derive(Clone, Default)]
pub struct SharedPlan {
    inner: Arc<Mutex<Plan>>,
}

impl SharedPlan {
    pub fn resource<Input: Clone + 'static + fmt::Debug, Output: Clone + 'static + fmt::Debug>(
        &self,
        rtype: ResourceType,
        manager: Arc<dyn ResourceManager<Input, Output>>,
        id: &str,
        state: ResourceState,
        input: Input,
    ) -> Result<SharedResource<Input, Output>, PlanError> {
        self.inner
            .lock()
            .unwrap()
            .add_resource(rtype, manager, id, state, input)
    }

    pub fn apply(&self, state: &mut StateStore, registry: &SharedRegistry) -> Result<(), PlanError> {
        self.inner.lock().unwrap().apply(state, registry)
    }

    pub fn destroy(
        &self,
        state: &mut StateStore,
        registry: &SharedRegistry,
    ) -> Result<(), PlanError> {
        self.inner.lock().unwrap().destroy(state, registry)
    }
}

#[derive(Default)]
pub struct Plan {
    resources: HashMap<String, Arc<dyn ResourceItem>>,
}

impl Plan {
    pub fn add_resource<
        Input: Clone + 'static + fmt::Debug,
        Output: Clone + 'static + fmt::Debug,
    >(
        &mut self,
        resource_type: ResourceType,
        manager: Arc<dyn ResourceManager<Input, Output>>,
        id: &str,
        state: ResourceState,
        input: Input,
    ) -> Result<SharedResource<Input, Output>, PlanError> {
        if self.resources.contains_key(id) {
            return Err(PlanError::ResourceAlreadyExists(id.to_owned()));
        }
        let resource = SharedResource::new_resource(resource_type, manager, id, input, state);
        self.resources
            .insert(id.to_owned(), Arc::new(resource.clone()) as Arc<dyn ResourceItem>);
        Ok(resource)
    }

    pub fn apply(&self, state: &mut StateStore, registry: &SharedRegistry) -> Result<(), PlanError> {
        println!("--- Applying plan ---");
        let sorted = self.sorted()?;
        self.apply_absent(state, registry, &sorted)?;
        self.apply_present(state, registry, &sorted)
    }

    fn apply_present(
        &self,
        state: &mut StateStore,
        registry: &SharedRegistry,
        sorted: &[Arc<dyn ResourceItem>],
    ) -> Result<(), PlanError> {
        println!("--- Ensuring resources are present ---");
        for resource in sorted {
            let id = resource.id();
            if resource.state() != ResourceState::Present {
                continue;
            }
            // Dependencies come earlier in the sorted order, so their outputs
            // exist by the time the bindings run.
            let latest = if state.contains(&id) {
                state.get(registry, &id)?
            } else {
                None
            };
            resource.apply_bindings()?;
            resource.ensure_present(latest)?;
            state.insert_resource(registry, resource.borrow())?;
        }
        Ok(())
    }

    /// Deletes everything the plan marks absent, then everything persisted in
    /// state that the plan no longer mentions. Children go before parents.
    fn apply_absent(
        &self,
        state: &mut StateStore,
        registry: &SharedRegistry,
        sorted: &[Arc<dyn ResourceItem>],
    ) -> Result<(), PlanError> {
        println!("--- Ensuring planned resources are absent ---");
        let mut kept = Vec::new();
        for resource in sorted.iter().rev() {
            match resource.state() {
                ResourceState::Absent => {
                    let id = resource.id();
                    if state.contains(&id) {
                        if let Some(latest) = state.get(registry, &id)? {
                            latest.ensure_absent()?;
                            state.remove(&id);
                        }
                    }
                }
                ResourceState::Present => kept.push(resource.id()),
            }
        }
        println!("--- Ensuring unplanned resources are absent ---");
        let stale = state
            .keys()
            .into_iter()
            .filter(|id| !kept.contains(id))
            .collect();
        self.delete_ids(stale, state, registry)
    }

    fn delete_ids(
        &self,
        ids: Vec<String>,
        state: &mut StateStore,
        registry: &SharedRegistry,
    ) -> Result<(), PlanError> {
        let mut to_delete = Vec::new();
        for id in ids {
            if let Some(resource) = state.get(registry, &id)? {
                to_delete.push(resource);
            }
        }
        let sorted = sort_by_dependencies(&to_delete)?;
        for item in sorted.into_iter().rev() {
            let id = item.id();
            if let Some(resource) = state.get(registry, &id)? {
                resource.ensure_absent()?;
            }
            state.remove(&id);
        }
        Ok(())
    }

    pub fn destroy(
        &self,
        state: &mut StateStore,
        registry: &SharedRegistry,
    ) -> Result<(), PlanError> {
        self.delete_ids(state.keys(), state, registry)
    }

    fn sorted(&self) -> Result<Vec<Arc<dyn ResourceItem>>, PlanError> {
        sort_by_dependencies(
            self.resources
                .values()
                .map(Arc::clone)
                .collect::<Vec<_>>()
                .as_slice(),
        )
    }
}

fn sort_by_dependencies(
    items: &[Arc<dyn ResourceItem>],
) -> Result<Vec<Arc<dyn ResourceItem>>, PlanError> {
    println!("--- Sorting resources by their dependencies ---");
    let mut indexes = HashMap::<String, NodeIndex>::new();
    let mut dag = StableDag::<Arc<dyn ResourceItem>, u32, u32>::new();
    for resource in items {
        let idx = dag.add_node(Arc::clone(resource));
        indexes.insert(resource.id(), idx);
    }
    for resource in items {
        for dep in resource.dependencies() {
            let dep_idx = indexes
                .get(&dep)
                .ok_or(PlanError::DependencyNotFound(dep.clone()))?;
            dag.add_edge(*dep_idx, indexes[&resource.id()], 0)
                .map_err(|err| PlanError::DependencyCycle(format!("{:?}", err)))?;
        }
    }
    let sorted = toposort(dag.graph(), None)
        .map_err(|err| PlanError::DependencyCycle(format!("{:?}", err)))?;
    Ok(sorted
        .into_iter()
        .map(|idx| Arc::clone(dag.node_weight(idx).unwrap()))
        .collect())
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Resource {0} already exists in the plan")]
    ResourceAlreadyExists(String),
    #[error("Dependency {0} not found in the plan")]
    DependencyNotFound(String),
    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),
    #[error(transparent)]
    ResourceError(#[from] ResourceError),
    #[error(transparent)]
    StateError(#[from] StateError),
}
