//! Predefined regular expressions for catalog file names.

use lazy_static::lazy_static;
use regex::Regex;

#[rustfmt::skip]
#[macro_export]
macro_rules! BACKUP_ID_RE { () => (r"[0-9A-Z]{1,13}") }

#[rustfmt::skip]
#[macro_export]
macro_rules! LOCK_HOLDER_RE { () => (r"[0-9]+-[0-9]+@[A-Za-z0-9.\-]+") }

#[rustfmt::skip]
#[macro_export]
macro_rules! WAL_SEGMENT_RE { () => (r"[0-9A-F]{24}") }

#[rustfmt::skip]
#[macro_export]
macro_rules! INSTANCE_NAME_RE { () => (r"[A-Za-z0-9_][A-Za-z0-9_.\-]{0,63}") }

lazy_static! {
    pub static ref INSTANCE_NAME_REGEX: Regex =
        Regex::new(concat!(r"^", INSTANCE_NAME_RE!(), r"$")).unwrap();

    pub static ref BACKUP_ID_REGEX: Regex = Regex::new(concat!(r"^", BACKUP_ID_RE!(), r"$")).unwrap();

    /// `<backup_id>_<holder>_<r|w>`
    pub static ref LOCK_FILE_REGEX: Regex = Regex::new(concat!(
        r"^(", BACKUP_ID_RE!(), r")_(", LOCK_HOLDER_RE!(), r")_([rw])$"
    ))
    .unwrap();

    pub static ref WAL_SEGMENT_REGEX: Regex =
        Regex::new(concat!(r"^", WAL_SEGMENT_RE!(), r"$")).unwrap();

    pub static ref TIMELINE_HISTORY_REGEX: Regex = Regex::new(r"^([0-9A-F]{8})\.history$").unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names() {
        assert!(INSTANCE_NAME_REGEX.is_match("main"));
        assert!(INSTANCE_NAME_REGEX.is_match("pg-15.replica_1"));
        assert!(!INSTANCE_NAME_REGEX.is_match("../main"));
        assert!(!INSTANCE_NAME_REGEX.is_match(".hidden"));
        assert!(BACKUP_ID_REGEX.is_match("S44WE8"));
        assert!(!BACKUP_ID_REGEX.is_match("s44we8"));
        assert!(WAL_SEGMENT_REGEX.is_match("000000010000000000000002"));
        assert_eq!(
            &TIMELINE_HISTORY_REGEX.captures("00000002.history").unwrap()[1],
            "00000002"
        );
    }
}
