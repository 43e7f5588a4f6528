//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Mask for the permission bits of a mode, including setuid, setgid, and sticky.
pub const PERMISSION_MASK: u32 = 0o7777;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Formats the permission bits of a mode the way `ls -l` does, e.g. `rwxr-xr-x`.
///
/// ## Examples
///
/// ```
/// use layerbench::utils::format_mode;
///
/// assert_eq!(format_mode(0o755), "rwxr-xr-x");
/// assert_eq!(format_mode(0o4755), "rwsr-xr-x");
/// assert_eq!(format_mode(0o1777), "rwxrwxrwt");
/// ```
pub fn format_mode(mode: u32) -> String {
    let special = [(0o4000, 0o100, 's'), (0o2000, 0o010, 's'), (0o1000, 0o001, 't')];
    let mut out = String::with_capacity(9);

    for (shift, (special_bit, exec_bit, special_char)) in [6, 3, 0].into_iter().zip(special) {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });

        let exec = mode & exec_bit != 0;
        out.push(match (mode & special_bit != 0, exec) {
            (true, true) => special_char,
            (true, false) => special_char.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }

    out
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mode_plain_permissions() {
        assert_eq!(format_mode(0o644), "rw-r--r--");
        assert_eq!(format_mode(0o700), "rwx------");
        assert_eq!(format_mode(0o000), "---------");
    }

    #[test]
    fn test_format_mode_special_bits_without_exec() {
        assert_eq!(format_mode(0o4644), "rwSr--r--");
        assert_eq!(format_mode(0o2640), "rw-r-S---");
        assert_eq!(format_mode(0o1666), "rw-rw-rwT");
    }
}
