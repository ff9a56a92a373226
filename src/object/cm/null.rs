use super::{CmContext, ObjectCm};
use crate::object::ObjectError;
use crate::types::Version;
use std::time::Duration;

/// Change manager of a detached object.
#[derive(Debug, Default)]
pub(crate) struct NullCm;

impl ObjectCm for NullCm {
    fn is_master(&self) -> bool {
        false
    }

    fn version(&self) -> Version {
        Version::NONE
    }

    fn commit(&mut self, _ctx: &CmContext<'_>, _publish: bool) -> Result<Version, ObjectError> {
        Err(ObjectError::NotAttached)
    }

    fn sync(
        &mut self,
        _ctx: &CmContext<'_>,
        _target: Version,
        _timeout: Option<Duration>,
    ) -> Result<Version, ObjectError> {
        Err(ObjectError::NotAttached)
    }
}
