//! Conversions that apply to every type of content.

use super::{ConversionRegistry, OutputType, OutputValue};
use crate::error::Result;
use crate::model::Resource;

fn last_modified(resource: &dyn Resource) -> Result<Option<OutputValue>> {
    Ok(resource.get_last_modified()?.map(OutputValue::LastModified))
}

fn fallback(_: &dyn Resource) -> Result<Option<OutputValue>> {
    Ok(Some(OutputValue::Fallback(true)))
}

pub(super) fn register(registry: &mut ConversionRegistry) -> Result<()> {
    registry.register(OutputType::LastModified, &[], last_modified)?;
    registry.register(OutputType::Fallback, &[], fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::file::FilesystemSource;
    use crate::model::{Handle, SourceManager, SourceRef};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_last_modified_of_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "x").unwrap();
        let root: SourceRef = Arc::new(FilesystemSource::new(tmp.path()).unwrap());
        let mut sm = SourceManager::new();
        let resource = Handle::new(root, "a.txt").follow(&mut sm).unwrap();
        let expected = resource.get_last_modified().unwrap().unwrap();
        assert_eq!(
            last_modified(resource.as_ref()).unwrap(),
            Some(OutputValue::LastModified(expected))
        );
    }
}
