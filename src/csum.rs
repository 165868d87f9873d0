//! Internet checksum helpers.
//!
//! All values are the big-endian words as they appear on the wire, read into host integers with
//! `u16::from_be_bytes`. One's complement arithmetic does not care about byte order as long as
//! every operand is read the same way.

/// One's complement add with end-around carry.
#[inline]
pub fn add16(csum: u16, addend: u16) -> u16 {
    let (res, carry) = csum.overflowing_add(addend);
    res + carry as u16
}

#[inline]
pub fn sub16(csum: u16, addend: u16) -> u16 {
    add16(csum, !addend)
}

/// Incrementally update `sum` after a 16 bit word changed from `old` to `new` (RFC 1624, eqn. 3).
#[inline]
pub fn replace2(sum: u16, old: u16, new: u16) -> u16 {
    !add16(sub16(!sum, old), new)
}

/// Incrementally update `sum` after a 32 bit field changed from `old` to `new`.
#[inline]
pub fn replace4(sum: u16, old: u32, new: u32) -> u16 {
    let sum = replace2(sum, (old >> 16) as u16, (new >> 16) as u16);
    replace2(sum, old as u16, new as u16)
}

/// Accumulate `data` as big-endian 16 bit words onto `acc`. An odd trailing byte is padded with
/// zero.
pub fn accumulate(mut acc: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        acc = fold32(acc + u16::from_be_bytes([c[0], c[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        acc = fold32(acc + ((*last as u32) << 8));
    }
    acc
}

#[inline]
fn fold32(mut acc: u32) -> u32 {
    while acc > 0xffff {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    acc
}

/// Fold an accumulator into the final one's complement checksum.
pub fn finish(acc: u32) -> u16 {
    !(fold32(acc) as u16)
}

/// Full checksum over `data`. Used to verify incremental updates.
pub fn checksum(data: &[u8]) -> u16 {
    finish(accumulate(0, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace2_known_value() {
        // echo request -> echo reply type word
        assert_eq!(replace2(0xcafe, 0x8000, 0x8100), 0xc9fe);
    }

    #[test]
    fn replace2_reverses() {
        let updated = replace2(0xcafe, 0x8000, 0x8100);
        assert_eq!(replace2(updated, 0x8100, 0x8000), 0xcafe);
    }

    #[test]
    fn add16_wraps_carry() {
        assert_eq!(add16(0xffff, 0x0001), 0x0001);
        assert_eq!(add16(0x8000, 0x8000), 0x0001);
        assert_eq!(sub16(0x0005, 0x0003), 0x0002);
    }

    #[test]
    fn replace4_matches_full_recompute() {
        // 20 byte IPv4 header, checksum field at 10..12
        let mut hdr: [u8; 20] = [
            0x45, 0x00, 0x00, 0x54, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x01, 0x0a, 0xc0, 0xa8, 0x01, 0x14,
        ];
        let sum = checksum(&hdr);
        hdr[10..12].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(checksum(&hdr), 0);

        let old = u32::from_be_bytes([hdr[16], hdr[17], hdr[18], hdr[19]]);
        let new = u32::from_be_bytes([172, 16, 9, 33]);
        hdr[16..20].copy_from_slice(&new.to_be_bytes());
        let updated = replace4(sum, old, new);

        hdr[10..12].copy_from_slice(&[0, 0]);
        assert_eq!(updated, checksum(&hdr));
    }

    #[test]
    fn odd_length_is_padded() {
        assert_eq!(accumulate(0, &[0x01]), 0x0100);
        assert_eq!(accumulate(0, &[0x01, 0x02, 0x03]), 0x0102 + 0x0300);
    }
}
