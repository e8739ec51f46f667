use std::{
    collections::HashMap,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    str::Split,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Error, bail};
use log::{debug, info};

use crate::{
    address::{
        AddressSpace, HEAP_ALLOCATION_SIZE, HeapState, Image, UNKNOWN_FUNCTION_ADDRESS,
        UNKNOWN_FUNCTION_NAME,
    },
    compress::LineTable,
    config::PreprocessorOptions,
    input::LineReader,
    mapfile,
    trace::{BranchKind, ImageRecord, TraceRecord, encoder::TraceEncoder},
};

/// Script-id field value marking an external (non-JavaScript) call target.
const EXTERNAL_SCRIPT_MARKER: &str = "E";

/// Name of the script table co-located with the raw traces.
const SCRIPTS_FILE_NAME: &str = "scripts.txt";

/// Name of the trace-prefix file co-located with the raw traces.
const PREFIX_TRACE_FILE_NAME: &str = "prefix.trace";

/// Converts raw textual execution traces into preprocessed binary traces
/// and collects the symbol information for the MAP files.
///
/// The first testcase handed to [`preprocess_testcase`] triggers the
/// single-threaded prefix pass: the script table and `prefix.trace` are
/// read from the testcase's directory and seed the state shared by all
/// subsequent testcases. Once the prefix is processed, testcases
/// preprocess fully in parallel.
///
/// [`preprocess_testcase`]: TracePreprocessor::preprocess_testcase
pub struct TracePreprocessor {
    options: PreprocessorOptions,
    prefix_gate: Mutex<()>,
    prefix_done: AtomicBool,
    state: OnceLock<Arc<SharedState>>,
    prefix_output: OnceLock<PreprocessedTrace>,
}

/// State seeded by the prefix pass and shared immutably by all testcase
/// workers.
struct SharedState {
    space: AddressSpace,
    line_table_seed: HashMap<i32, Arc<str>>,
    heap_seed: HeapState,
}

impl TracePreprocessor {
    /// Validates the options and prepares the target directories.
    ///
    /// # Errors
    ///
    /// This function fails if the options violate their constraints or if
    /// a target directory cannot be created.
    pub fn new(options: PreprocessorOptions) -> Result<Self, Error> {
        options.validate()?;

        fs::create_dir_all(&options.map_directory)?;
        if let Some(directory) = &options.output_directory {
            fs::create_dir_all(directory)?;
        }

        Ok(Self {
            options,
            prefix_gate: Mutex::new(()),
            prefix_done: AtomicBool::new(false),
            state: OnceLock::new(),
            prefix_output: OnceLock::new(),
        })
    }

    /// Preprocesses one raw testcase trace into the binary format.
    ///
    /// The caller may invoke this from many threads at once; the first
    /// invocation runs the prefix pass while the others wait at the gate.
    ///
    /// # Errors
    ///
    /// This function fails on I/O errors, on malformed trace input and
    /// when the prefix pass failed earlier.
    pub fn preprocess_testcase<P: AsRef<Path>>(
        &self,
        raw_trace: P,
    ) -> Result<PreprocessedTrace, Error> {
        let raw_trace = raw_trace.as_ref();
        let state = self.shared_state(raw_trace)?;

        let Some(name) = raw_trace.file_name().and_then(|name| name.to_str()) else {
            bail!("invalid trace path {}", raw_trace.display());
        };

        let input = File::open(raw_trace)?;
        let input_length = input.metadata()?.len();
        let (encoder, output_path) = self.open_sink(name, input_length)?;

        let mut worker = TraceWorker::testcase(&state, encoder);
        worker.run(LineReader::new(input))?;
        let (_, _, encoder, records) = worker.into_parts();

        let output = PreprocessedTrace::finish(name.to_string(), records, encoder, output_path)?;
        debug!("preprocessed testcase {name}: {records} records");

        Ok(output)
    }

    /// Returns the preprocessed trace prefix, once the prefix pass ran.
    pub fn prefix_trace(&self) -> Option<&PreprocessedTrace> {
        self.prefix_output.get()
    }

    /// Emits one MAP file per image, resolving every requested address.
    ///
    /// # Errors
    ///
    /// This function fails if no prefix has been processed yet or if
    /// writing a MAP file fails.
    pub fn write_map_files(&self) -> Result<(), Error> {
        let Some(state) = self.state.get() else {
            bail!("no trace prefix has been processed; map files cannot be emitted");
        };

        mapfile::write_map_files(&state.space, &self.options.map_directory)?;
        info!(
            "map files written to {}",
            self.options.map_directory.display()
        );

        Ok(())
    }

    fn shared_state(&self, raw_trace: &Path) -> Result<Arc<SharedState>, Error> {
        if !self.prefix_done.load(Ordering::Acquire) {
            let _gate = match self.prefix_gate.lock() {
                Ok(gate) => gate,
                Err(_) => bail!("prefix gate was poisoned"),
            };

            if !self.prefix_done.load(Ordering::Acquire) {
                let directory = raw_trace.parent().unwrap_or(Path::new("."));
                match self.run_prefix(directory) {
                    Ok((state, output)) => {
                        // Publish the state before the flag: a fast-path
                        // reader that sees the flag must find it populated.
                        if self.state.set(Arc::new(state)).is_err() {
                            bail!("prefix state was initialized twice");
                        }
                        if self.prefix_output.set(output).is_err() {
                            bail!("prefix output was initialized twice");
                        }
                        self.prefix_done.store(true, Ordering::Release);
                    }
                    Err(error) => {
                        // The flag flips even on failure so that waiting
                        // workers do not re-attempt the prefix pass.
                        self.prefix_done.store(true, Ordering::Release);
                        return Err(error);
                    }
                }
            }
        }

        match self.state.get() {
            Some(state) => Ok(state.clone()),
            None => bail!("trace prefix processing failed; cannot preprocess testcase"),
        }
    }

    fn run_prefix(&self, directory: &Path) -> Result<(SharedState, PreprocessedTrace), Error> {
        info!("trace prefix pass started in {}", directory.display());

        let scripts = File::open(directory.join(SCRIPTS_FILE_NAME))?;
        let space = AddressSpace::load(scripts, self.options.columns_bits)?;
        debug!("loaded {} images", space.images().len());

        let external = space.external_image();
        external.record_function_name(
            (UNKNOWN_FUNCTION_ADDRESS, UNKNOWN_FUNCTION_ADDRESS),
            UNKNOWN_FUNCTION_NAME,
        );
        external.request_address(UNKNOWN_FUNCTION_ADDRESS);

        let input = File::open(directory.join(PREFIX_TRACE_FILE_NAME))?;
        let input_length = input.metadata()?.len();
        let (mut encoder, output_path) = self.open_sink(PREFIX_TRACE_FILE_NAME, input_length)?;

        let image_records: Vec<ImageRecord> =
            space.images().iter().map(Image::record).collect();
        encoder.write_image_table(&image_records)?;

        let mut worker = TraceWorker::prefix(&space, encoder);
        worker.run(LineReader::new(input))?;
        let (lines, heap, encoder, records) = worker.into_parts();

        let output = PreprocessedTrace::finish(
            PREFIX_TRACE_FILE_NAME.to_string(),
            records,
            encoder,
            output_path,
        )?;
        info!("trace prefix pass complete: {records} records");

        let state = SharedState {
            space,
            line_table_seed: lines.into_entries(),
            heap_seed: heap,
        };

        Ok((state, output))
    }

    fn open_sink(
        &self,
        name: &str,
        input_length: u64,
    ) -> Result<(TraceEncoder, Option<PathBuf>), Error> {
        if self.options.store_traces {
            let Some(directory) = &self.options.output_directory else {
                bail!("store-traces requires an output-directory");
            };
            let path = directory.join(format!("{name}.preprocessed"));
            Ok((TraceEncoder::to_file(&path)?, Some(path)))
        } else {
            Ok((TraceEncoder::in_memory(input_length as usize), None))
        }
    }
}

/// A preprocessed binary trace, kept in memory or persisted to disk.
#[derive(Debug)]
pub struct PreprocessedTrace {
    name: String,
    records: usize,
    data: TraceData,
}

#[derive(Debug)]
enum TraceData {
    Memory(Vec<u8>),
    Stored(PathBuf),
}

impl PreprocessedTrace {
    fn finish(
        name: String,
        records: usize,
        encoder: TraceEncoder,
        output_path: Option<PathBuf>,
    ) -> Result<Self, Error> {
        let bytes = encoder.finish()?;
        let data = match output_path {
            Some(path) => TraceData::Stored(path),
            None => TraceData::Memory(bytes.unwrap_or_default()),
        };

        Ok(Self {
            name,
            records,
            data,
        })
    }

    /// Name of the raw trace this output was preprocessed from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of binary records written.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// The binary trace, if it was kept in memory.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.data {
            TraceData::Memory(bytes) => Some(bytes),
            TraceData::Stored(_) => None,
        }
    }

    /// The path of the binary trace, if it was persisted.
    pub fn path(&self) -> Option<&Path> {
        match &self.data {
            TraceData::Memory(_) => None,
            TraceData::Stored(path) => Some(path),
        }
    }
}

/// The per-trace event state machine.
///
/// One worker preprocesses exactly one raw trace: the prefix (emitting
/// only heap allocations and seeding the shared state) or one testcase
/// (emitting the full record stream into its own sink). Workers never
/// share their line-table overlay or heap-object map; the heap allocation
/// cursor is shared so object regions never collide across testcases.
struct TraceWorker<'a> {
    space: &'a AddressSpace,
    prefix_mode: bool,
    lines: LineTable,
    heap: HeapState,
    last_return_source: Option<(i32, u32)>,
    encoder: TraceEncoder,
    records: usize,
}

impl<'a> TraceWorker<'a> {
    fn prefix(space: &'a AddressSpace, encoder: TraceEncoder) -> Self {
        Self {
            space,
            prefix_mode: true,
            lines: LineTable::new(),
            heap: HeapState::new(),
            last_return_source: None,
            encoder,
            records: 0,
        }
    }

    fn testcase(state: &'a SharedState, encoder: TraceEncoder) -> Self {
        Self {
            space: &state.space,
            prefix_mode: false,
            lines: LineTable::seeded(&state.line_table_seed),
            heap: state.heap_seed.clone(),
            last_return_source: None,
            encoder,
            records: 0,
        }
    }

    fn run<R: Read>(&mut self, mut reader: LineReader<R>) -> Result<(), Error> {
        let mut scratch = String::new();
        while let Some(raw) = reader.next_line()? {
            let raw = std::str::from_utf8(raw)?;
            let Some(event) = self.lines.decode(raw, &mut scratch)? else {
                continue;
            };
            self.handle_event(event)?;
        }

        Ok(())
    }

    fn into_parts(self) -> (LineTable, HeapState, TraceEncoder, usize) {
        (self.lines, self.heap, self.encoder, self.records)
    }

    fn handle_event(&mut self, event: &str) -> Result<(), Error> {
        let mut fields = event.split(';');
        match fields.next().unwrap_or("") {
            "c" => self.handle_call(&mut fields, event),
            "r" => self.handle_return_source(&mut fields, event),
            "R" => self.handle_return_destination(&mut fields, event),
            "j" => self.handle_jump(&mut fields, event),
            "m" => self.handle_memory_access(&mut fields, event),
            other => bail!("unknown event type {other:?} in trace line {event:?}"),
        }
    }

    fn handle_call(&mut self, fields: &mut Split<'_, char>, event: &str) -> Result<(), Error> {
        let source_script = parse_script_id(expect_field(fields, event)?, event)?;
        let source_position = expect_field(fields, event)?;
        let destination_script = expect_field(fields, event)?;
        let destination_position = expect_field(fields, event)?;
        let name = expect_field(fields, event)?;

        let (source_image, (source_address, _)) = self
            .space
            .resolve_position(source_script, source_position)?;
        source_image.request_address(source_address);

        let (destination_image, destination) = if destination_script == EXTERNAL_SCRIPT_MARKER {
            self.space.resolve_external(destination_position)
        } else {
            let destination_script = parse_script_id(destination_script, event)?;
            self.space
                .resolve_position(destination_script, destination_position)?
        };

        destination_image.record_function_name(destination, name);
        destination_image.request_address(destination.0);
        destination_image.request_address(destination.1);

        if !self.prefix_mode {
            self.emit(TraceRecord::Branch {
                source_image: source_image.id(),
                source_address,
                destination_image: destination_image.id(),
                destination_address: destination.0,
                taken: true,
                kind: BranchKind::Call,
            })?;
        }

        Ok(())
    }

    fn handle_return_source(
        &mut self,
        fields: &mut Split<'_, char>,
        event: &str,
    ) -> Result<(), Error> {
        let script = parse_script_id(expect_field(fields, event)?, event)?;
        let position = expect_field(fields, event)?;

        let (image, (address, _)) = self.space.resolve_position(script, position)?;
        image.request_address(address);

        if !self.prefix_mode {
            self.last_return_source = Some((image.id(), address));
        }

        Ok(())
    }

    fn handle_return_destination(
        &mut self,
        fields: &mut Split<'_, char>,
        event: &str,
    ) -> Result<(), Error> {
        let script = parse_script_id(expect_field(fields, event)?, event)?;
        let position = expect_field(fields, event)?;

        let (image, (address, _)) = self.space.resolve_position(script, position)?;
        image.request_address(address);

        if !self.prefix_mode {
            // A return without a recorded source is anchored at the
            // catch-all [unknown] function of the external image.
            let (source_image, source_address) = self.last_return_source.take().unwrap_or((
                self.space.external_image().id(),
                UNKNOWN_FUNCTION_ADDRESS,
            ));
            self.emit(TraceRecord::Branch {
                source_image,
                source_address,
                destination_image: image.id(),
                destination_address: address,
                taken: true,
                kind: BranchKind::Return,
            })?;
        }

        Ok(())
    }

    fn handle_jump(&mut self, fields: &mut Split<'_, char>, event: &str) -> Result<(), Error> {
        let script = parse_script_id(expect_field(fields, event)?, event)?;
        let source_position = expect_field(fields, event)?;
        let destination_position = expect_field(fields, event)?;

        let (image, (source_address, _)) = self.space.resolve_position(script, source_position)?;
        let (_, (destination_address, _)) =
            self.space.resolve_position(script, destination_position)?;
        image.request_address(source_address);
        image.request_address(destination_address);

        if !self.prefix_mode {
            self.emit(TraceRecord::Branch {
                source_image: image.id(),
                source_address,
                destination_image: image.id(),
                destination_address,
                taken: true,
                kind: BranchKind::Jump,
            })?;
        }

        Ok(())
    }

    fn handle_memory_access(
        &mut self,
        fields: &mut Split<'_, char>,
        event: &str,
    ) -> Result<(), Error> {
        let is_write = match expect_field(fields, event)? {
            "w" => true,
            "r" => false,
            other => bail!("unknown memory access type {other:?} in trace line {event:?}"),
        };
        let script = parse_script_id(expect_field(fields, event)?, event)?;
        let position = expect_field(fields, event)?;
        let object_field = expect_field(fields, event)?;
        let Ok(object_id) = object_field.parse::<i32>() else {
            bail!("invalid object id {object_field:?} in trace line {event:?}");
        };
        let offset = expect_field(fields, event)?;

        let (image, (address, _)) = self.space.resolve_position(script, position)?;
        image.request_address(address);

        let (object, created) = self.heap.object(object_id);
        if created {
            self.emit(TraceRecord::HeapAllocation {
                id: object_id,
                address: object.address(),
                size: HEAP_ALLOCATION_SIZE as u32,
            })?;
        }

        let memory_address = object.resolve_property(offset);

        if !self.prefix_mode {
            self.emit(TraceRecord::HeapMemoryAccess {
                instruction_image: image.id(),
                instruction_address: address,
                allocation_id: object_id,
                memory_address,
                size: 1,
                is_write,
            })?;
        }

        Ok(())
    }

    fn emit(&mut self, record: TraceRecord) -> Result<(), Error> {
        self.encoder.write_record(&record)?;
        self.records += 1;
        Ok(())
    }
}

fn expect_field<'e>(fields: &mut Split<'e, char>, event: &str) -> Result<&'e str, Error> {
    match fields.next() {
        Some(field) => Ok(field),
        None => bail!("truncated event line {event:?}"),
    }
}

fn parse_script_id(field: &str, event: &str) -> Result<i32, Error> {
    match field.parse() {
        Ok(id) => Ok(id),
        Err(_) => bail!("invalid script id {field:?} in trace line {event:?}"),
    }
}
