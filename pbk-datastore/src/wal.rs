//! WAL archive of an instance.
//!
//! Segments are stored under their database names (`TTTTTTTTXXXXXXXXYYYYYYYY`), timeline
//! history files as `TTTTTTTT.history`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Error};

use pbk_api_types::common_regex::{TIMELINE_HISTORY_REGEX, WAL_SEGMENT_REGEX};
use pbk_api_types::{BackupId, Lsn, TimeLineId};

use crate::error::CatalogError;
use crate::storage::CatalogStorage;

const XLOG_ID_SPAN: u64 = 0x1_0000_0000;

/// One WAL segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalSegment {
    pub tli: TimeLineId,
    pub segno: u64,
}

impl WalSegment {
    pub fn for_lsn(tli: TimeLineId, lsn: Lsn, segment_size: u64) -> Self {
        Self {
            tli,
            segno: lsn.segment_number(segment_size),
        }
    }

    pub fn parse(name: &str, segment_size: u64) -> Result<Self, Error> {
        if !WAL_SEGMENT_REGEX.is_match(name) {
            bail!("{name:?} is not a WAL segment name");
        }
        let field = |range: std::ops::Range<usize>| u64::from_str_radix(&name[range], 16);
        let tli = field(0..8)? as TimeLineId;
        let log = field(8..16)?;
        let seg = field(16..24)?;

        let per_id = XLOG_ID_SPAN / segment_size;
        if seg >= per_id {
            bail!("WAL segment {name} does not fit segment size {segment_size}");
        }
        Ok(Self {
            tli,
            segno: log * per_id + seg,
        })
    }

    pub fn file_name(&self, segment_size: u64) -> String {
        let per_id = XLOG_ID_SPAN / segment_size;
        format!(
            "{:08X}{:08X}{:08X}",
            self.tli,
            self.segno / per_id,
            self.segno % per_id
        )
    }
}

/// Timeline ancestry, read from a `.history` file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimelineHistory {
    tli: TimeLineId,
    /// Ancestor timelines, oldest first, with the position their successor branched off.
    /// `None` when the switch point is not known.
    parents: Vec<(TimeLineId, Option<Lsn>)>,
}

impl TimelineHistory {
    /// History without switch points, every lower timeline is assumed to be an ancestor.
    pub fn implicit(tli: TimeLineId) -> Self {
        Self {
            tli,
            parents: (1..tli).map(|parent| (parent, None)).collect(),
        }
    }

    pub fn parse(tli: TimeLineId, data: &str) -> Result<Self, Error> {
        let mut parents = Vec::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (parent, switchpoint) = match (fields.next(), fields.next()) {
                (Some(parent), Some(switchpoint)) => (parent, switchpoint),
                _ => bail!("syntax error in history file of timeline {tli}: {line:?}"),
            };
            let parent: TimeLineId = parent
                .parse()
                .map_err(|err| format_err!("invalid timeline in history file - {err}"))?;
            if parent >= tli || parents.iter().any(|(known, _)| *known >= parent) {
                bail!("history file of timeline {tli} is not ordered");
            }
            parents.push((parent, Some(switchpoint.parse()?)));
        }
        Ok(Self { tli, parents })
    }

    pub fn timeline(&self) -> TimeLineId {
        self.tli
    }

    /// Ancestor timelines, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = (TimeLineId, Option<Lsn>)> + '_ {
        self.parents.iter().rev().copied()
    }

    /// Whether WAL position `lsn` on timeline `tli` is part of this timeline's past.
    pub fn contains(&self, tli: TimeLineId, lsn: Lsn) -> bool {
        if tli == self.tli {
            return true;
        }
        self.parents
            .iter()
            .any(|(parent, switchpoint)| *parent == tli && switchpoint.map_or(true, |sp| lsn <= sp))
    }
}

/// Whether a pushed file was new.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    AlreadyArchived,
}

pub struct WalArchive {
    storage: Arc<dyn CatalogStorage>,
    dir: PathBuf,
    segment_size: u64,
}

impl WalArchive {
    pub fn new(storage: Arc<dyn CatalogStorage>, dir: PathBuf, segment_size: u64) -> Self {
        Self {
            storage,
            dir,
            segment_size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Archive a segment or history file.
    ///
    /// Pushing a file again with identical content succeeds, different content for an archived
    /// name is refused.
    pub fn push(&self, name: &str, data: &[u8]) -> Result<PushOutcome, Error> {
        if WAL_SEGMENT_REGEX.is_match(name) {
            WalSegment::parse(name, self.segment_size)?;
            if data.len() as u64 != self.segment_size {
                bail!(
                    "WAL segment {name} has size {}, expected {}",
                    data.len(),
                    self.segment_size
                );
            }
        } else if !TIMELINE_HISTORY_REGEX.is_match(name) {
            bail!("refusing to archive {name:?} - neither a WAL segment nor a history file");
        }

        let path = self.dir.join(name);
        if let Some(existing) = self.storage.read(&path)? {
            if existing == data {
                log::info!("WAL file {name} already archived, skipping");
                return Ok(PushOutcome::AlreadyArchived);
            }
            bail!("WAL file {name} already exists in the archive with different content");
        }

        self.storage.replace(&path, data)?;
        log::debug!("archived WAL file {name}");
        Ok(PushOutcome::Stored)
    }

    pub fn contains(&self, segment: &WalSegment) -> Result<bool, Error> {
        self.storage
            .exists(&self.dir.join(segment.file_name(self.segment_size)))
    }

    /// All archived segments, ordered by timeline and position.
    pub fn list_segments(&self) -> Result<Vec<WalSegment>, Error> {
        let mut list = Vec::new();
        for name in self.storage.list(&self.dir, "")? {
            if WAL_SEGMENT_REGEX.is_match(&name) {
                list.push(WalSegment::parse(&name, self.segment_size)?);
            }
        }
        list.sort_unstable();
        Ok(list)
    }

    /// Check that every segment needed to make `backup_id` consistent is archived.
    pub fn check_range(
        &self,
        backup_id: BackupId,
        tli: TimeLineId,
        start_lsn: Lsn,
        stop_lsn: Lsn,
    ) -> Result<(), Error> {
        if !start_lsn.is_valid() || stop_lsn < start_lsn {
            bail!("backup {backup_id}: invalid WAL range {start_lsn} - {stop_lsn}");
        }
        let first = start_lsn.segment_number(self.segment_size);
        let last = stop_lsn.segment_number(self.segment_size);
        for segno in first..=last {
            let segment = WalSegment { tli, segno };
            if !self.contains(&segment)? {
                return Err(CatalogError::WalMissing {
                    backup_id,
                    segment: segment.file_name(self.segment_size),
                }
                .into());
            }
        }
        Ok(())
    }

    /// History of `tli`, implicit if no history file was archived.
    pub fn timeline_history(&self, tli: TimeLineId) -> Result<TimelineHistory, Error> {
        if tli <= 1 {
            return Ok(TimelineHistory::implicit(tli));
        }
        let path = self.dir.join(format!("{tli:08X}.history"));
        match self.storage.read(&path)? {
            Some(data) => {
                let text = String::from_utf8(data)
                    .map_err(|_| format_err!("history file of timeline {tli} is not UTF-8"))?;
                TimelineHistory::parse(tli, &text)
            }
            None => Ok(TimelineHistory::implicit(tli)),
        }
    }

    /// Remove segments before the first one still needed on each timeline.
    ///
    /// Timelines missing from `keep_from` are left alone. Returns the removed file names.
    pub fn purge(
        &self,
        keep_from: &BTreeMap<TimeLineId, u64>,
        dry_run: bool,
    ) -> Result<Vec<String>, Error> {
        let mut removed = Vec::new();
        for segment in self.list_segments()? {
            let keep = match keep_from.get(&segment.tli) {
                Some(first_needed) => segment.segno >= *first_needed,
                None => true,
            };
            if keep {
                continue;
            }
            let name = segment.file_name(self.segment_size);
            if !dry_run {
                self.storage.remove(&self.dir.join(&name))?;
            }
            removed.push(name);
        }
        if !removed.is_empty() {
            log::info!(
                "{} {} WAL segments ({} .. {})",
                if dry_run { "would remove" } else { "removed" },
                removed.len(),
                removed[0],
                removed[removed.len() - 1],
            );
        }
        Ok(removed)
    }
}
