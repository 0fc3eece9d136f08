use std::io::Read;

use anyhow::{format_err, Error};

use pbk_datastore::{Catalog, PushOutcome};

/// Store a WAL segment (or timeline history file) handed over by the database.
///
/// Pushing a file that is archived already with the same content succeeds, so the database
/// may retry an archive command whose result it did not see.
pub fn archive_push(
    catalog: &Catalog,
    name: &str,
    reader: &mut dyn Read,
) -> Result<PushOutcome, Error> {
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|err| format_err!("unable to read WAL file {name} - {err}"))?;

    let outcome = catalog.wal_archive().push(name, &data)?;
    if outcome == PushOutcome::Stored {
        log::info!("archived {name} ({} bytes) for instance '{}'", data.len(), catalog.name());
    }
    Ok(outcome)
}
