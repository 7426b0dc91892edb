use thiserror::Error;

/// The seam between the declarative layer and the per-service SDK mappers.
/// `Input` is the desired configuration, `Output` what the service reports
/// back after the calls land.
pub trait ResourceManager<Input, Output>: Send + Sync {
    fn lookup(&self, latest: &Output) -> Result<Option<Output>, ManagerError>;
    fn lookup_by_input(&self, input: &Input) -> Result<Option<Output>, ManagerError>;
    fn create(&self, input: &mut Input) -> Result<Output, ManagerError>;
    fn delete(&self, latest: &Output) -> Result<bool, ManagerError>;
    fn syncup(&self, latest: &Output, input: &mut Input) -> Result<Option<Output>, ManagerError>;

    fn ensure_absent(&self, latest: &Output) -> Result<bool, ManagerError> {
        match self.lookup(latest)? {
            Some(_) => self.delete(latest),
            None => Ok(false),
        }
    }

    fn ensure_present(
        &self,
        latest: Option<&Output>,
        input: &mut Input,
    ) -> Result<Output, ManagerError> {
        let latest = latest.and_then(|latest| self.lookup(latest).unwrap_or(None));
        let actual = self.lookup_by_input(input)?;
        match actual.or(latest) {
            Some(output) => Ok(self.syncup(&output, input)?.unwrap_or(output)),
            None => self.create(input),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    #[error("CreateFail: {0}")]
    CreateFail(String),
    #[error("UpdateFail: {0}")]
    UpdateFail(String),
    #[error("DeleteFail: {0}")]
    DeleteFail(String),
    #[error("LookupFail: {0}")]
    LookupFail(String),
}
