use std::path::PathBuf;

use anyhow::Error;
use clap::Parser;
use jsgrind::PreprocessorOptions;

#[derive(Parser)]
#[command(about = "Preprocesses JavaScript execution traces for side-channel analysis")]
struct Cli {
    /// Directory receiving one MAP file per script
    #[arg(long)]
    map_directory: PathBuf,

    /// Directory receiving preprocessed binary traces
    #[arg(long)]
    output_directory: Option<PathBuf>,

    /// Persist preprocessed traces instead of keeping them in memory
    #[arg(long)]
    store_traces: bool,

    /// Column bit-width of 32-bit source-position addresses
    #[arg(long, default_value_t = jsgrind::config::DEFAULT_COLUMNS_BITS)]
    columns_bits: u32,

    /// Raw testcase trace files; scripts.txt and prefix.trace are expected
    /// next to them
    #[arg(required = true)]
    traces: Vec<PathBuf>,
}

fn main() -> Result<(), Error> {
    env_logger::init();
    let args = Cli::parse();

    let options = PreprocessorOptions {
        map_directory: args.map_directory,
        output_directory: args.output_directory,
        store_traces: args.store_traces,
        columns_bits: args.columns_bits,
    };

    for output in jsgrind::preprocess_traces(options, &args.traces)? {
        println!("t\t{}\t{}", output.name(), output.record_count());
    }

    Ok(())
}
