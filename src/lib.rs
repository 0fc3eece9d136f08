//! Catalog engine for physical database backups.
//!
//! The catalog itself (storage, locks, status machine and chain resolution) is implemented
//! in `pbk-datastore`, this crate provides the operations run against it.

pub mod backup;

/// Process exit code for the result of an operation.
///
/// Catalog errors get their own codes, anything else exits with 1.
pub fn exit_code(result: &Result<(), anyhow::Error>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => pbk_datastore::catalog_error(err).map_or(1, |err| err.exit_code()),
    }
}
