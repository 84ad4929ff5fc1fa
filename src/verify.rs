//! Read-back verification

use crate::Error;

/// Compare `actual` against `expected`, returning the offset of the first
/// differing byte or `expected.len()` when every byte matches.
///
/// A shorter `actual` mismatches at its end. Check `result == expected.len()`
/// for success, zero is a valid mismatch offset.
pub fn compare(expected: &[u8], actual: &[u8]) -> usize {
    expected
        .iter()
        .enumerate()
        .find(|(i, e)| actual.get(*i) != Some(*e))
        .map(|(i, _)| i)
        .unwrap_or_else(|| expected.len())
}

/// Check data read back from `address` against the `expected` image,
/// failing with the address and offset of the first differing byte.
pub fn check_image<E>(address: u32, expected: &[u8], actual: &[u8]) -> Result<(), Error<E>> {
    let offset = compare(expected, actual);
    if offset != expected.len() {
        let address = address + offset as u32;
        error!("Verification failed on addr 0x{:08x}", address);
        return Err(Error::Verify { address, offset });
    }

    info!("Verification is successful");
    Ok(())
}
