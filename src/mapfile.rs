use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::Error;
use log::debug;

use crate::address::{AddressPair, AddressSpace, Image};

/// Writes one MAP file per image into the map directory.
///
/// A MAP file starts with the original image name, followed by one line
/// per requested address in ascending order, resolving each address to the
/// nearest enclosing function name.
pub(crate) fn write_map_files(space: &AddressSpace, map_directory: &Path) -> Result<(), Error> {
    for image in space.images() {
        write_image_map(image, map_directory, space.columns_bits())?;
    }

    Ok(())
}

fn write_image_map(image: &Image, map_directory: &Path, columns_bits: u32) -> Result<(), Error> {
    let path = map_directory.join(format!("{}.map", sanitize_image_name(image.name())));
    debug!("writing map file {}", path.display());

    let mut writer = BufWriter::new(File::create(&path)?);
    writeln!(writer, "{}", image.name())?;

    let ranges = image.function_ranges();
    for address in image.requested_addresses() {
        let name = enclosing_function(&ranges, address).unwrap_or("?");
        if image.is_external() {
            writeln!(writer, "{address:08x}\t{name}")?;
        } else {
            let line = address >> columns_bits;
            let column = address & ((1 << columns_bits) - 1);
            writeln!(writer, "{address:08x}\t{name}:{line}:{column}")?;
        }
    }

    writer.flush()?;

    Ok(())
}

/// Replaces path-hostile characters in an image name so it can serve as a
/// file name on every supported platform.
fn sanitize_image_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '.' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Finds the function covering `address`: the last range (in `(start,
/// end)` order) satisfying `start <= address <= end`.
fn enclosing_function(ranges: &[(AddressPair, String)], address: u32) -> Option<&str> {
    let upper = ranges.partition_point(|((start, _), _)| *start <= address);
    ranges[..upper]
        .iter()
        .rev()
        .find(|((_, end), _)| address <= *end)
        .map(|(_, name)| name.as_str())
}
