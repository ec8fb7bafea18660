//! Backend Sources: the roots of every exploration.

pub mod data;
pub mod ews;
pub mod file;
pub mod smb;
pub mod smbc;
pub mod web;

use crate::error::Result;
use crate::model::SourceRegistry;

pub(crate) fn register(registry: &mut SourceRegistry) -> Result<()> {
    data::register(registry)?;
    ews::register(registry)?;
    file::register(registry)?;
    smb::register(registry)?;
    smbc::register(registry)?;
    web::register(registry)
}
