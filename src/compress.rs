use std::{collections::HashMap, sync::Arc};

use anyhow::{Error, bail};

/// Dictionary used by the streaming line-compression protocol of raw traces.
///
/// Raw trace lines either declare a dictionary entry (`L:<id>|<prefix>`) or
/// reference one. A reference starts with the line id, encoded as a decimal
/// number or as a single letter `a`-`s` denoting an offset in `[-9, +9]`
/// relative to the previously referenced id, optionally followed by
/// `|<suffix>`. The referenced line expands to the recorded prefix with the
/// suffix appended.
///
/// The table seeded by the trace prefix is shared across testcases; each
/// worker operates on a shallow copy so that its own declarations stay
/// local.
pub(crate) struct LineTable {
    entries: HashMap<i32, Arc<str>>,
    last_id: i32,
}

impl LineTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            last_id: 0,
        }
    }

    /// Creates a worker-local table containing the shared seed entries.
    pub fn seeded(seed: &HashMap<i32, Arc<str>>) -> Self {
        Self {
            entries: seed.clone(),
            last_id: 0,
        }
    }

    /// Consumes the table into its entries, to be used as a shared seed.
    pub fn into_entries(self) -> HashMap<i32, Arc<str>> {
        self.entries
    }

    /// Processes one raw trace line.
    ///
    /// Declarations update the table and yield `None`. References expand
    /// into `scratch` and yield the decompressed event line.
    ///
    /// # Errors
    ///
    /// This function fails on malformed declarations, on unrecognized
    /// leading characters and on references to undeclared line ids.
    pub fn decode<'s>(
        &mut self,
        raw: &str,
        scratch: &'s mut String,
    ) -> Result<Option<&'s str>, Error> {
        let Some(&first) = raw.as_bytes().first() else {
            bail!("empty trace line");
        };

        let (id, suffix) = match first {
            b'L' => {
                let Some(declaration) = raw.strip_prefix("L:") else {
                    bail!("malformed line declaration {raw:?}");
                };
                let Some((id_text, prefix)) = declaration.split_once('|') else {
                    bail!("malformed line declaration {raw:?}");
                };
                let Ok(id) = id_text.parse::<i32>() else {
                    bail!("malformed line declaration {raw:?}");
                };
                self.entries.insert(id, Arc::from(prefix));
                return Ok(None);
            }
            c @ b'a'..=b's' => {
                let id = self.last_id + (i32::from(c) - i32::from(b'j'));
                (id, Self::suffix_of(&raw[1..], raw)?)
            }
            b'0'..=b'9' => match raw.split_once('|') {
                Some((id_text, suffix)) => (Self::parse_id(id_text, raw)?, suffix),
                None => (Self::parse_id(raw, raw)?, ""),
            },
            _ => bail!("unrecognized line id in trace line {raw:?}"),
        };

        let Some(prefix) = self.entries.get(&id) else {
            bail!("unknown line id {id} referenced by trace line {raw:?}");
        };
        self.last_id = id;

        scratch.clear();
        scratch.push_str(prefix);
        scratch.push_str(suffix);

        Ok(Some(scratch.as_str()))
    }

    fn parse_id(text: &str, raw: &str) -> Result<i32, Error> {
        match text.parse::<i32>() {
            Ok(id) => Ok(id),
            Err(_) => bail!("invalid line id in trace line {raw:?}"),
        }
    }

    fn suffix_of<'r>(rest: &'r str, raw: &str) -> Result<&'r str, Error> {
        if rest.is_empty() {
            Ok("")
        } else if let Some(suffix) = rest.strip_prefix('|') {
            Ok(suffix)
        } else {
            bail!("malformed line reference {raw:?}");
        }
    }
}
