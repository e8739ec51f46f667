use std::{io::Read, path::PathBuf};

use anyhow::{Error, ensure};
use serde::Deserialize;

/// Upper bound for [`PreprocessorOptions::columns_bits`].
///
/// Two more bits would leave no room for the line number in the 32-bit
/// source-position address.
pub const MAX_COLUMNS_BITS: u32 = 30;

/// Default number of column bits in a 32-bit source-position address.
pub const DEFAULT_COLUMNS_BITS: u32 = 13;

/// Configuration of the trace preprocessor.
///
/// The options mirror the configuration keys of the surrounding analysis
/// pipeline (`map-directory`, `output-directory`, `store-traces`,
/// `columns-bits`) and can be deserialized from a JSON document via
/// [`PreprocessorOptions::from_json`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PreprocessorOptions {
    /// Target directory for the emitted MAP files. Created if absent.
    pub map_directory: PathBuf,

    /// Target directory for preprocessed binary traces.
    ///
    /// Required if [`store_traces`][PreprocessorOptions::store_traces]
    /// is set.
    #[serde(default)]
    pub output_directory: Option<PathBuf>,

    /// Persist preprocessed traces to disk instead of keeping them in memory.
    #[serde(default)]
    pub store_traces: bool,

    /// Number of bits reserved for the column in a 32-bit source-position
    /// address. The remaining high bits hold the line number.
    #[serde(default = "default_columns_bits")]
    pub columns_bits: u32,
}

fn default_columns_bits() -> u32 {
    DEFAULT_COLUMNS_BITS
}

impl PreprocessorOptions {
    /// Creates options with the given map directory and all defaults.
    pub fn new<P: Into<PathBuf>>(map_directory: P) -> Self {
        Self {
            map_directory: map_directory.into(),
            output_directory: None,
            store_traces: false,
            columns_bits: DEFAULT_COLUMNS_BITS,
        }
    }

    /// Reads and validates options from a JSON document.
    ///
    /// # Errors
    ///
    /// This function fails if the document is not valid JSON, contains
    /// unknown keys, or violates one of the [`validate`] rules.
    ///
    /// [`validate`]: PreprocessorOptions::validate
    pub fn from_json<R: Read>(input: R) -> Result<Self, Error> {
        let options: Self = serde_json::from_reader(input)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks the inter-option constraints.
    ///
    /// # Errors
    ///
    /// This function fails if `columns_bits` exceeds [`MAX_COLUMNS_BITS`]
    /// or if `store_traces` is set without an `output_directory`.
    pub fn validate(&self) -> Result<(), Error> {
        ensure!(
            self.columns_bits <= MAX_COLUMNS_BITS,
            "columns-bits must be at most {MAX_COLUMNS_BITS}, got {}",
            self.columns_bits
        );
        ensure!(
            !self.store_traces || self.output_directory.is_some(),
            "store-traces requires an output-directory"
        );

        Ok(())
    }
}
