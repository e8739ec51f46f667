use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read},
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use anyhow::{Error, anyhow, bail, ensure};
use dashmap::{DashMap, DashSet};

use crate::trace::ImageRecord;

/// Name of the synthetic image that owns all non-JavaScript callables.
pub const EXTERNAL_IMAGE_NAME: &str = "[extern]";

/// Catch-all function name for control flow without a resolvable source.
pub const UNKNOWN_FUNCTION_NAME: &str = "[unknown]";

/// Reserved external-function address backing [`UNKNOWN_FUNCTION_NAME`].
pub const UNKNOWN_FUNCTION_ADDRESS: u32 = 1;

/// Granularity of the synthetic heap address space; every object owns two
/// of these chunks.
pub const HEAP_CHUNK_SIZE: u64 = 0x10_0000;

/// Size of the synthetic region assigned to each heap object.
pub const HEAP_ALLOCATION_SIZE: u64 = 2 * HEAP_CHUNK_SIZE;

/// First synthetic offset handed out for a non-numeric property name.
pub const FIRST_PROPERTY_ADDRESS: u32 = HEAP_CHUNK_SIZE as u32;

/// A `(start, end)` pair of 32-bit relative addresses.
pub(crate) type AddressPair = (u32, u32);

/// Packs a source position into a 32-bit relative address.
///
/// Line or column values exceeding the configured bit budget are silently
/// truncated by the shift/OR.
pub(crate) fn pack_address(line: u32, column: u32, columns_bits: u32) -> u32 {
    (line << columns_bits) | column
}

fn parse_position_key(key: &str) -> Result<[u32; 4], Error> {
    let mut bounds = [0u32; 4];
    let mut parts = key.split(':');
    for bound in &mut bounds {
        *bound = parts
            .next()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| anyhow!("invalid source position {key:?}"))?;
    }
    ensure!(parts.next().is_none(), "invalid source position {key:?}");

    Ok(bounds)
}

/// An immutable descriptor of a loaded script, together with the address
/// lookups that accumulate for it over a run.
///
/// The virtual address window of image `n` is `[n << 32, n << 32 | 2^32-1]`;
/// all relative addresses of the image map into this window.
#[derive(Debug)]
pub(crate) struct Image {
    id: i32,
    name: String,
    interesting: bool,
    start: u64,
    end: u64,
    external: bool,
    position_addresses: DashMap<String, AddressPair>,
    function_names: DashMap<AddressPair, String>,
    requested_entries: DashSet<u32>,
}

impl Image {
    fn new(id: i32, name: String, external: bool) -> Self {
        let start = (id as u64) << 32;
        Self {
            id,
            name,
            interesting: true,
            start,
            end: start | 0xFFFF_FFFF,
            external,
            position_addresses: DashMap::new(),
            function_names: DashMap::new(),
            requested_entries: DashSet::new(),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn record(&self) -> ImageRecord {
        ImageRecord {
            id: self.id,
            interesting: self.interesting,
            start: self.start,
            end: self.end,
            name: self.name.clone(),
        }
    }

    /// Resolves a textual position key `"sL:sC:eL:eC"` to its stable
    /// `(start, end)` address pair, allocating it on first sight.
    pub fn resolve_position(&self, key: &str, columns_bits: u32) -> Result<AddressPair, Error> {
        if let Some(pair) = self.position_addresses.get(key) {
            return Ok(*pair);
        }

        let [start_line, start_column, end_line, end_column] = parse_position_key(key)?;
        let pair = (
            pack_address(start_line, start_column, columns_bits),
            pack_address(end_line, end_column, columns_bits),
        );

        Ok(*self
            .position_addresses
            .entry(key.to_string())
            .or_insert(pair))
    }

    /// Records the function name covering an address pair. The first
    /// observation wins; duplicates are tolerated silently.
    pub fn record_function_name(&self, pair: AddressPair, name: &str) {
        self.function_names
            .entry(pair)
            .or_insert_with(|| name.to_string());
    }

    /// Marks a relative address as referenced by the trace, so that the
    /// map-file emitter resolves a name for it at shutdown.
    pub fn request_address(&self, address: u32) {
        self.requested_entries.insert(address);
    }

    /// Returns all requested addresses in ascending order.
    pub fn requested_addresses(&self) -> Vec<u32> {
        let mut addresses: Vec<u32> = self.requested_entries.iter().map(|a| *a).collect();
        addresses.sort_unstable();
        addresses
    }

    /// Returns the known function ranges sorted by `(start, end)`.
    pub fn function_ranges(&self) -> Vec<(AddressPair, String)> {
        let mut ranges: Vec<(AddressPair, String)> = self
            .function_names
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        ranges.sort_unstable_by_key(|(pair, _)| *pair);
        ranges
    }
}

/// Process-wide registry of external (non-JavaScript) functions.
///
/// Every distinct name receives a serial address from an atomic counter;
/// address [`UNKNOWN_FUNCTION_ADDRESS`] stays reserved for the catch-all.
#[derive(Debug)]
pub(crate) struct ExternalFunctions {
    addresses: DashMap<String, AddressPair>,
    next_address: AtomicU32,
}

impl ExternalFunctions {
    fn new() -> Self {
        Self {
            addresses: DashMap::new(),
            next_address: AtomicU32::new(UNKNOWN_FUNCTION_ADDRESS + 1),
        }
    }

    /// Returns the stable address pair of an external function, allocating
    /// a fresh serial address on first sight. Both pair members are equal.
    pub fn resolve(&self, name: &str) -> AddressPair {
        if let Some(pair) = self.addresses.get(name) {
            return *pair;
        }

        *self.addresses.entry(name.to_string()).or_insert_with(|| {
            let address = self.next_address.fetch_add(1, Ordering::SeqCst);
            (address, address)
        })
    }
}

/// The immutable image list plus the shared allocator state spanning all
/// testcases of a run.
#[derive(Debug)]
pub(crate) struct AddressSpace {
    images: Vec<Image>,
    external_image: usize,
    external_functions: ExternalFunctions,
    columns_bits: u32,
}

impl AddressSpace {
    /// Builds the address space from `scripts.txt` content: one
    /// tab-separated `<id>\t<name>` record per line, ids zero-based and
    /// contiguous. A synthetic external image is appended after all
    /// scripts.
    pub fn load<R: Read>(scripts: R, columns_bits: u32) -> Result<Self, Error> {
        let mut images = Vec::new();
        for line in BufReader::new(scripts).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }

            let Some((id_text, name)) = line.split_once('\t') else {
                bail!("malformed script record {line:?}");
            };
            let id: i32 = match id_text.parse() {
                Ok(id) => id,
                Err(_) => bail!("malformed script record {line:?}"),
            };
            ensure!(
                id >= 0 && id as usize == images.len(),
                "script ids must be zero-based and contiguous, got {id} at position {}",
                images.len()
            );

            images.push(Image::new(id, name.to_string(), false));
        }

        let external_image = images.len();
        images.push(Image::new(
            external_image as i32,
            EXTERNAL_IMAGE_NAME.to_string(),
            true,
        ));

        Ok(Self {
            images,
            external_image,
            external_functions: ExternalFunctions::new(),
            columns_bits,
        })
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn external_image(&self) -> &Image {
        &self.images[self.external_image]
    }

    pub fn image(&self, script_id: i32) -> Result<&Image, Error> {
        let index = usize::try_from(script_id)
            .ok()
            .filter(|&index| index < self.external_image);
        match index {
            Some(index) => Ok(&self.images[index]),
            None => bail!("unknown script id {script_id}"),
        }
    }

    /// Resolves a script-relative source position to its owning image and
    /// stable address pair.
    pub fn resolve_position(&self, script_id: i32, key: &str) -> Result<(&Image, AddressPair), Error> {
        let image = self.image(script_id)?;
        let pair = image.resolve_position(key, self.columns_bits)?;
        Ok((image, pair))
    }

    /// Resolves an external function name to the external image and its
    /// serial address pair.
    pub fn resolve_external(&self, name: &str) -> (&Image, AddressPair) {
        (
            self.external_image(),
            self.external_functions.resolve(name),
        )
    }

    pub fn columns_bits(&self) -> u32 {
        self.columns_bits
    }
}

/// A heap object observed in a trace: its synthetic base address and the
/// per-property offsets allocated within its region.
///
/// Objects created during the trace prefix are shared between all
/// testcase workers, so the property counter is atomic and the offset map
/// is concurrent.
pub(crate) struct HeapObject {
    address: u64,
    next_property_address: AtomicU32,
    properties: DashMap<String, u32>,
}

impl HeapObject {
    fn new(address: u64) -> Self {
        Self {
            address,
            next_property_address: AtomicU32::new(FIRST_PROPERTY_ADDRESS),
            properties: DashMap::new(),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Resolves a property name to its offset within the object's region.
    ///
    /// Numeric names decode as their integer value and consume no counter;
    /// all others receive the next free synthetic offset on first sight.
    pub fn resolve_property(&self, name: &str) -> u32 {
        if let Ok(numeric) = name.parse::<u32>() {
            return numeric;
        }

        if let Some(offset) = self.properties.get(name) {
            return *offset;
        }

        *self.properties.entry(name.to_string()).or_insert_with(|| {
            self.next_property_address.fetch_add(1, Ordering::SeqCst)
        })
    }
}

/// The worker-local view of the synthetic heap.
///
/// Cloning is shallow: the object map is copied and the objects themselves
/// are shared, so first sightings of an id stay local to a worker. The
/// allocation cursor is a shared atomic seeded by the prefix pass, so
/// object regions stay disjoint across concurrently-running testcases.
#[derive(Clone)]
pub(crate) struct HeapState {
    objects: HashMap<i32, Arc<HeapObject>>,
    next_allocation_address: Arc<AtomicU64>,
}

impl HeapState {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_allocation_address: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the object with the given id, creating it on first sight.
    /// The boolean is `true` if this call created the object.
    pub fn object(&mut self, id: i32) -> (Arc<HeapObject>, bool) {
        if let Some(object) = self.objects.get(&id) {
            return (object.clone(), false);
        }

        let address = self
            .next_allocation_address
            .fetch_add(HEAP_ALLOCATION_SIZE, Ordering::SeqCst);
        let object = Arc::new(HeapObject::new(address));
        self.objects.insert(id, object.clone());
        (object, true)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use super::{
        AddressSpace, FIRST_PROPERTY_ADDRESS, HEAP_ALLOCATION_SIZE, HeapState,
        UNKNOWN_FUNCTION_ADDRESS, pack_address,
    };

    fn example_space() -> Result<AddressSpace, Error> {
        AddressSpace::load(&b"0\tapp.js\n1\tlib/crypto.js\n"[..], 13)
    }

    #[test]
    fn load_images_appends_external() -> Result<(), Error> {
        let space = example_space()?;

        assert_eq!(space.images().len(), 3);
        assert_eq!(space.images()[0].name(), "app.js");
        assert_eq!(space.images()[1].name(), "lib/crypto.js");
        assert_eq!(space.external_image().name(), "[extern]");
        assert_eq!(space.external_image().id(), 2);
        assert!(space.external_image().is_external());
        assert_eq!(space.images()[1].record().start, 1 << 32);
        assert_eq!(space.images()[1].record().end, (1 << 32) | 0xFFFF_FFFF);

        Ok(())
    }

    #[test]
    fn fail_on_non_contiguous_script_ids() {
        AddressSpace::load(&b"0\tapp.js\n2\tother.js\n"[..], 13).unwrap_err();
        AddressSpace::load(&b"1\tapp.js\n"[..], 13).unwrap_err();
    }

    #[test]
    fn fail_on_malformed_script_record() {
        AddressSpace::load(&b"0 app.js\n"[..], 13).unwrap_err();
        AddressSpace::load(&b"x\tapp.js\n"[..], 13).unwrap_err();
    }

    #[test]
    fn position_pairs_are_stable() -> Result<(), Error> {
        let space = example_space()?;

        let (image, first) = space.resolve_position(0, "1:2:1:5")?;
        assert_eq!(image.id(), 0);
        assert_eq!(first, ((1 << 13) | 2, (1 << 13) | 5));

        let (_, second) = space.resolve_position(0, "1:2:1:5")?;
        assert_eq!(first, second);

        // the same key on another image resolves independently
        let (other_image, other) = space.resolve_position(1, "1:2:1:5")?;
        assert_eq!(other_image.id(), 1);
        assert_eq!(other, first);

        Ok(())
    }

    #[test]
    fn fail_on_invalid_position_key() -> Result<(), Error> {
        let space = example_space()?;

        fn resolve(space: &AddressSpace, script_id: i32, key: &str) -> Result<(u32, u32), Error> {
            space.resolve_position(script_id, key).map(|(_, pair)| pair)
        }

        resolve(&space, 0, "1:2:1").unwrap_err();
        resolve(&space, 0, "1:2:1:5:9").unwrap_err();
        resolve(&space, 0, "1:x:1:5").unwrap_err();
        resolve(&space, 7, "1:2:1:5").unwrap_err();

        Ok(())
    }

    #[test]
    fn external_addresses_are_serial_and_stable() -> Result<(), Error> {
        let space = example_space()?;

        let (image, first) = space.resolve_external("foo:constructor");
        assert!(image.is_external());
        assert_eq!(first, (2, 2));
        assert!(first.0 > UNKNOWN_FUNCTION_ADDRESS);

        let (_, second) = space.resolve_external("bar");
        assert_eq!(second, (3, 3));

        assert_eq!(space.resolve_external("foo:constructor").1, first);

        Ok(())
    }

    #[test]
    fn heap_objects_occupy_disjoint_regions() {
        let mut heap = HeapState::new();

        let (first, created) = heap.object(42);
        assert!(created);
        assert_eq!(first.address(), 0);

        let (second, created) = heap.object(7);
        assert!(created);
        assert_eq!(second.address(), HEAP_ALLOCATION_SIZE);

        let (again, created) = heap.object(42);
        assert!(!created);
        assert_eq!(again.address(), 0);
    }

    #[test]
    fn property_offsets() {
        let mut heap = HeapState::new();
        let (object, _) = heap.object(42);

        // numeric names decode as their value and consume no counter
        assert_eq!(object.resolve_property("7"), 7);

        assert_eq!(object.resolve_property("foo"), FIRST_PROPERTY_ADDRESS);
        assert_eq!(object.resolve_property("foo"), FIRST_PROPERTY_ADDRESS);
        assert_eq!(object.resolve_property("bar"), FIRST_PROPERTY_ADDRESS + 1);
    }

    #[test]
    fn seeded_heap_shares_objects_but_not_the_map() {
        let mut seed = HeapState::new();
        let (shared, _) = seed.object(1);
        shared.resolve_property("foo");

        let mut worker = seed.clone();
        // the seeded object is the same instance
        let (object, created) = worker.object(1);
        assert!(!created);
        assert_eq!(object.resolve_property("foo"), shared.resolve_property("foo"));

        // new objects stay local to the worker, but draw from the shared
        // cursor, so the same id first-observed in both views still gets
        // disjoint regions
        let (worker_object, created) = worker.object(2);
        assert!(created);
        let (seed_object, created_in_seed) = seed.object(2);
        assert!(created_in_seed);
        assert_ne!(worker_object.address(), seed_object.address());
    }

    #[test]
    fn pack_truncates_overflowing_columns() {
        assert_eq!(pack_address(10, 4, 13), (10 << 13) | 4);
        // a column wider than the budget bleeds into the line bits
        assert_eq!(pack_address(0, 1 << 14, 13), 1 << 14);
    }
}
