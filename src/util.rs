use std::fmt;

pub(crate) fn is_pow_of_two(val: u64) -> bool {
    val != 0 && (val & (val - 1)) == 0
}

/// Display adapter for link-layer addresses.
pub(crate) struct Mac<'a>(pub &'a [u8; 6]);

impl fmt::Display for Mac<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_powers_of_two() {
        assert!(!is_pow_of_two(0));
        assert!(is_pow_of_two(1));
        assert!(is_pow_of_two(2));
        assert!(!is_pow_of_two(3));
        assert!(is_pow_of_two(64));
        assert!(!is_pow_of_two(96));
        assert!(is_pow_of_two(2048));
        assert!(!is_pow_of_two(4095));
        assert!(is_pow_of_two(1 << 40));
    }

    #[test]
    fn test_mac_display() {
        let mac = [0x02, 0x00, 0x5e, 0x10, 0xab, 0x0f];
        assert_eq!(Mac(&mac).to_string(), "02:00:5e:10:ab:0f");
    }
}
