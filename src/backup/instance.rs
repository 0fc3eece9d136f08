use std::path::Path;
use std::sync::Arc;

use anyhow::Error;

use pbk_api_types::CatalogConfig;
use pbk_datastore::{Catalog, LocalStorage, ProcessIdentity, SystemClock};

/// Create the catalog directories of a new instance on the local file system and store its
/// configuration.
pub fn init_instance(base: &Path, instance: &str, config: CatalogConfig) -> Result<Catalog, Error> {
    let catalog = Catalog::new(
        base,
        instance,
        Arc::new(LocalStorage::new()),
        Arc::new(SystemClock),
        Arc::new(ProcessIdentity::current()?),
        config,
    )?;
    catalog.add_instance()?;

    let _lock = pbk_config::lock_config(base, instance)?;
    pbk_config::save_config(base, instance, catalog.config())?;
    Ok(catalog)
}
