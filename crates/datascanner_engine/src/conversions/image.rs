//! Pixel dimensions of raster images.

use super::{ConversionRegistry, OutputType, OutputValue};
use crate::error::Result;
use crate::model::Resource;
use image::io::Reader;
use std::io::Cursor;
use tracing::debug;

fn dimensions(resource: &dyn Resource) -> Result<Option<OutputValue>> {
    let bytes = resource.read_all()?;
    let reader = match Reader::new(Cursor::new(bytes)).with_guessed_format() {
        Ok(reader) => reader,
        Err(e) => {
            debug!(handle = %resource.handle(), error = %e, "Could not identify image format");
            return Ok(None);
        }
    };
    match reader.into_dimensions() {
        Ok((width, height)) => Ok(Some(OutputValue::ImageDimensions(width, height))),
        Err(e) => {
            debug!(handle = %resource.handle(), error = %e, "Could not read image dimensions");
            Ok(None)
        }
    }
}

pub(super) fn register(registry: &mut ConversionRegistry) -> Result<()> {
    registry.register(
        OutputType::ImageDimensions,
        &["image/png", "image/jpeg", "image/gif", "image/x-ms-bmp"],
        dimensions,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::data::DataSource;
    use crate::model::{Handle, SourceManager, SourceRef};
    use image::{ImageOutputFormat, RgbImage};
    use std::sync::Arc;

    fn resource_of(bytes: Vec<u8>, mime: &str, sm: &mut SourceManager) -> Box<dyn Resource> {
        let source: SourceRef = Arc::new(DataSource::new(bytes, mime));
        Handle::new(source, "file").follow(sm).unwrap()
    }

    #[test]
    fn test_png_dimensions() {
        let mut png = Cursor::new(Vec::new());
        RgbImage::new(300, 200).write_to(&mut png, ImageOutputFormat::Png).unwrap();
        let mut sm = SourceManager::new();
        let resource = resource_of(png.into_inner(), "image/png", &mut sm);
        assert_eq!(
            dimensions(resource.as_ref()).unwrap(),
            Some(OutputValue::ImageDimensions(300, 200))
        );
    }

    #[test]
    fn test_unreadable_image_gives_nothing() {
        let mut sm = SourceManager::new();
        let resource = resource_of(b"\x89PNG not really".to_vec(), "image/png", &mut sm);
        assert_eq!(dimensions(resource.as_ref()).unwrap(), None);
    }
}
