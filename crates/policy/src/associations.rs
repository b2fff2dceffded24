//! Interning of fingerprints into dense automaton state ids.
//!
//! The map is segmented by executable name and persisted as plain text, one
//! section per executable. Ids start at 1 and are handed out in insertion
//! order across the whole map; id 0 is reserved for the automaton start
//! state and never appears here.

use crate::error::Error;
use crate::fingerprint::Fingerprint;
use crate::StateId;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SECTION_START: &str = "Section begin: ";
const SECTION_END: &str = "Section end";
const ID_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Section {
    by_print: BTreeMap<Fingerprint, StateId>,
    by_id: BTreeMap<StateId, Fingerprint>,
}

pub struct FingerprintMap {
    path: PathBuf,
    sections: BTreeMap<Box<str>, Section>,
    total: u32,
}

impl FingerprintMap {
    /// Open the map at `path`, importing previously stored associations when
    /// the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let mut map = Self {
            path,
            sections: BTreeMap::new(),
            total: 0,
        };
        match std::fs::read_to_string(&map.path) {
            Ok(text) => {
                map.import(&text)?;
                info!(
                    path = %map.path.display(),
                    associations = map.total,
                    "associations imported"
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %map.path.display(), "no stored associations yet");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(map)
    }

    /// An empty in-memory map, for construction from scratch.
    pub fn in_memory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sections: BTreeMap::new(),
            total: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Intern a fingerprint. Idempotent on fingerprint equality within an
    /// executable's section; a novel fingerprint gets the next dense id.
    pub fn insert(&mut self, executable: &str, fingerprint: Fingerprint) -> StateId {
        let section = self.sections.entry(executable.into()).or_default();
        if let Some(&id) = section.by_print.get(&fingerprint) {
            return id;
        }
        let id = self.total + 1;
        section.by_print.insert(fingerprint.clone(), id);
        section.by_id.insert(id, fingerprint);
        self.total += 1;
        id
    }

    /// Read-only lookup.
    pub fn find(&self, executable: &str, fingerprint: &Fingerprint) -> Option<StateId> {
        self.sections
            .get(executable)?
            .by_print
            .get(fingerprint)
            .copied()
    }

    /// Reverse lookup of an association number within an executable section.
    pub fn fingerprint_of(&self, executable: &str, id: StateId) -> Option<&Fingerprint> {
        self.sections.get(executable)?.by_id.get(&id)
    }

    /// Total number of associations across all executables.
    pub fn len(&self) -> u32 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Persist every section to the backing file.
    pub fn save(&self) -> Result<(), Error> {
        let mut out = String::new();
        for (executable, section) in &self.sections {
            out.push_str(SECTION_START);
            out.push_str(executable);
            out.push('\n');
            for (id, fingerprint) in &section.by_id {
                out.push_str(&id.to_string());
                out.push(ID_SEPARATOR);
                out.push_str(&fingerprint.serialise());
                out.push('\n');
            }
            out.push_str(SECTION_END);
            out.push('\n');
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, out)?;
        info!(path = %self.path.display(), associations = self.total, "associations saved");
        Ok(())
    }

    fn import(&mut self, text: &str) -> Result<(), Error> {
        let mut lines = text.lines();
        while let Some(line) = lines.next() {
            if line.is_empty() {
                continue;
            }
            let Some(executable) = line.strip_prefix(SECTION_START) else {
                return Err(Error::Associations(format!(
                    "expected a section header, found {line:?}"
                )));
            };
            if executable.is_empty() {
                return Err(Error::Associations("empty executable name".into()));
            }
            loop {
                let Some(line) = lines.next() else {
                    return Err(Error::Associations(format!(
                        "section for {executable} is not terminated"
                    )));
                };
                if line == SECTION_END {
                    break;
                }
                let Some((id_text, print_text)) = line.split_once(ID_SEPARATOR) else {
                    return Err(Error::Associations(format!(
                        "missing association number in {line:?}"
                    )));
                };
                let id: StateId = id_text.parse().map_err(|_| {
                    Error::Associations(format!("invalid association number {id_text:?}"))
                })?;
                if id < 1 {
                    return Err(Error::Associations(format!(
                        "association number {id} is out of range"
                    )));
                }
                let fingerprint = Fingerprint::parse(print_text)?;
                let section = self.sections.entry(executable.into()).or_default();
                if section.by_id.insert(id, fingerprint.clone()).is_some()
                    || section.by_print.insert(fingerprint, id).is_some()
                {
                    warn!(executable, id, "duplicate association dropped");
                    return Err(Error::Associations(format!(
                        "duplicate association {id} for {executable}"
                    )));
                }
                self.total += 1;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FingerprintMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintMap")
            .field("path", &self.path)
            .field("executables", &self.sections.len())
            .field("associations", &self.total)
            .finish()
    }
}

/// The backing path is not part of a map's identity.
impl PartialEq for FingerprintMap {
    fn eq(&self, other: &Self) -> bool {
        self.total == other.total && self.sections == other.sections
    }
}
