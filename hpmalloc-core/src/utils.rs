//! A collection of utilities.

use core::str;

mod power_of_2;

pub use power_of_2::PowerOf2;

/// Copies `name` into `buffer`, truncated on a character boundary, and zero-fills the rest.
pub(crate) fn copy_name(name: &str, buffer: &mut [u8]) {
    let mut length = name.len().min(buffer.len());

    while !name.is_char_boundary(length) {
        length -= 1;
    }

    buffer[..length].copy_from_slice(&name.as_bytes()[..length]);

    for byte in &mut buffer[length..] {
        *byte = 0;
    }
}

/// Reads back a name stored by `copy_name`.
pub(crate) fn read_name(buffer: &[u8]) -> &str {
    let length = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());

    str::from_utf8(&buffer[..length]).unwrap_or("?")
}
