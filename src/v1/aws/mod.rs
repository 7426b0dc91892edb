pub mod wafregional;

use std::{fmt, marker::PhantomData, str::FromStr, sync::Arc};

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_wafregional::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use strum_macros::EnumString;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use self::wafregional::{ip_set::IpSet, rule::Rule};
use super::{
    manager::ResourceManager,
    plan::{PlanError, SharedPlan},
    registry::{
        RProvider, RType, Registry, RegistryError, ResourceSerde, ResourceSerdeProvider,
        ResourceType,
    },
    resource::{ResourceError, ResourceState, SharedResource},
    token::{ChangeTokenRetryer, RegionLocks, REGION_LOCKS},
};

#[derive(Serialize, Deserialize, Debug, Clone, EnumString, strum_macros::Display)]
pub enum WafType {
    #[strum(ascii_case_insensitive)]
    IpSet,
    Rule,
}

/// Everything a WAF Regional manager needs besides its Input/Output types:
/// the SDK config, the runtime handle, and the shared token-coordination
/// state for the region.
#[derive(Clone)]
pub struct WafEnv {
    pub handle: Handle,
    pub config: SdkConfig,
    pub region: String,
    pub locks: Arc<RegionLocks>,
    pub cancel: CancellationToken,
}

pub struct WafProvider {
    plan: SharedPlan,
    env: WafEnv,
    rprovider: RProvider,
}

impl WafProvider {
    pub fn new(handle: &Handle, plan: SharedPlan, rprovider: RProvider) -> Self {
        handle.clone().block_on(async move {
            let region = Region::new(rprovider.region.clone());
            let config = aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .load()
                .await;
            Self {
                plan,
                env: WafEnv {
                    handle: handle.clone(),
                    config,
                    region: rprovider.region.clone(),
                    locks: REGION_LOCKS.clone(),
                    cancel: CancellationToken::new(),
                },
                rprovider,
            }
        })
    }

    pub fn resource<W: WafResourceCreator>(
        &self,
        id: &str,
        state: ResourceState,
        mut input: W::Input,
    ) -> Result<WafResource<W::Input, W::Output>, PlanError> {
        W::input_hook(id, &mut input);
        Ok(WafResource {
            waf: self,
            inner: W::create(&self.plan, &self.env, self.rprovider.clone(), id, state, input)?,
        })
    }
}

impl ResourceSerdeProvider for WafProvider {
    fn get_resource_serde(
        &self,
        r: &Registry,
        t: &ResourceType,
    ) -> Result<ResourceSerde, RegistryError> {
        match WafType::from_str(t.rtype.name.as_str())
            .map_err(|_| RegistryError::ResourceTypeNotSupported(t.rtype.name.clone()))?
        {
            WafType::IpSet => r.serde(IpSet::manager(&self.env)),
            WafType::Rule => r.serde(Rule::manager(&self.env)),
        }
    }
}

/// Per-resource-type SDK mapper. Sync trait methods `block_on` the async SDK
/// through the stored handle; every mutating call goes through a
/// [`ChangeTokenRetryer`] for its region.
pub struct WafManager<Input, Output> {
    pub(crate) client: Client,
    pub(crate) handle: Handle,
    pub(crate) region: String,
    pub(crate) locks: Arc<RegionLocks>,
    pub(crate) cancel: CancellationToken,
    _phantom: PhantomData<(Input, Output)>,
}

impl<Input, Output> WafManager<Input, Output>
where
    Input: 'static + Clone + Serialize + DeserializeOwned,
    Output: 'static + Clone + Serialize + DeserializeOwned,
    WafManager<Input, Output>: ResourceManager<Input, Output>,
{
    pub fn new(env: &WafEnv) -> Self {
        Self {
            client: Client::new(&env.config),
            handle: env.handle.clone(),
            region: env.region.clone(),
            locks: env.locks.clone(),
            cancel: env.cancel.clone(),
            _phantom: PhantomData,
        }
    }

    pub(crate) fn retryer(&self) -> ChangeTokenRetryer<Client> {
        ChangeTokenRetryer::new(self.client.clone(), self.region.clone(), self.locks.clone())
    }

    fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[derive(Clone)]
pub struct WafResource<'a, Input: Clone, Output: Clone> {
    pub waf: &'a WafProvider,
    pub inner: SharedResource<Input, Output>,
}

impl<'a, Input: Clone + 'static, Output: Clone + 'static> WafResource<'a, Input, Output> {
    pub fn bind<I2: 'static + Clone, O2: 'static + Clone>(
        &self,
        dep: &WafResource<'a, I2, O2>,
        bind_fn: impl Fn(&mut Input, &O2) + 'static,
    ) -> Result<(), ResourceError> {
        self.inner.bind(&dep.inner, bind_fn)
    }
}

pub trait WafResourceCreator {
    type Input: Clone + fmt::Debug + 'static;
    type Output: Clone + fmt::Debug + 'static;

    fn r#type() -> WafType;
    fn manager(env: &WafEnv) -> Arc<dyn ResourceManager<Self::Input, Self::Output>>;
    fn input_hook(id: &str, input: &mut Self::Input);

    fn create(
        plan: &SharedPlan,
        env: &WafEnv,
        rprovider: RProvider,
        id: &str,
        state: ResourceState,
        input: Self::Input,
    ) -> Result<SharedResource<Self::Input, Self::Output>, PlanError> {
        plan.resource(
            ResourceType {
                rprovider,
                rtype: RType {
                    name: Self::r#type().to_string(),
                },
            },
            Self::manager(env),
            id,
            state,
            input,
        )
    }
}
