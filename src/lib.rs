use std::path::Path;

use anyhow::{Error, anyhow};

mod address;
mod compress;

/// Preprocessor configuration.
pub mod config;

mod input;
mod mapfile;

/// The trace preprocessor and its two-phase execution model.
pub mod preprocess;

/// The preprocessed binary trace format.
pub mod trace;

pub use config::PreprocessorOptions;
pub use preprocess::{PreprocessedTrace, TracePreprocessor};
pub use trace::{
    BranchKind, ImageRecord, TraceRecord, encoder::TraceEncoder, parser::TraceParser,
};

/// Preprocesses a batch of raw testcase traces and emits the MAP files.
///
/// The first trace triggers the single-threaded prefix pass; all traces
/// are then preprocessed in parallel, one OS thread per testcase. The
/// returned outputs follow the order of `raw_traces`.
///
/// # Errors
///
/// This function fails if the options are invalid, if any testcase fails
/// to preprocess or if emitting the MAP files fails.
pub fn preprocess_traces<P: AsRef<Path> + Sync>(
    options: PreprocessorOptions,
    raw_traces: &[P],
) -> Result<Vec<PreprocessedTrace>, Error> {
    let preprocessor = TracePreprocessor::new(options)?;
    let preprocessor = &preprocessor;

    let results: Vec<Result<PreprocessedTrace, Error>> = std::thread::scope(|scope| {
        let handles: Vec<_> = raw_traces
            .iter()
            .map(|raw_trace| scope.spawn(move || preprocessor.preprocess_testcase(raw_trace)))
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("testcase worker thread panicked")),
            })
            .collect()
    });

    let mut outputs = Vec::with_capacity(results.len());
    for result in results {
        outputs.push(result?);
    }

    preprocessor.write_map_files()?;

    Ok(outputs)
}
