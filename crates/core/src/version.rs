use std::fmt;

/// Four-component version number (`major.minor.build.revision`).
///
/// Components are stored as `u32` so callers can express any value, but both
/// the protocol schema and discovery announces encode them as `u16`;
/// [`fits_u16`](Self::fits_u16) is checked wherever a version is validated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Whether every component fits the 16-bit wire encoding.
    pub fn fits_u16(&self) -> bool {
        self.components()
            .iter()
            .all(|&c| c <= u32::from(u16::MAX))
    }

    pub fn components(&self) -> [u32; 4] {
        [self.major, self.minor, self.build, self.revision]
    }

    /// Write as 4 big-endian `u16`s. Callers validate with `fits_u16` first.
    pub(crate) fn write_u16s(&self, out: &mut Vec<u8>) {
        for c in self.components() {
            out.extend_from_slice(&(c as u16).to_be_bytes());
        }
    }

    pub(crate) fn from_u16s(c: [u16; 4]) -> Self {
        Self::new(c[0].into(), c[1].into(), c[2].into(), c[3].into())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_dotted() {
        assert_eq!(Version::new(2, 5, 3, 8).to_string(), "2.5.3.8");
    }

    #[test]
    fn u16_bounds() {
        assert!(Version::new(65535, 0, 0, 0).fits_u16());
        assert!(!Version::new(0, 0, 65536, 0).fits_u16());
    }

    #[test]
    fn u16_encoding() {
        let mut out = Vec::new();
        Version::new(1, 2, 3, 0x1234).write_u16s(&mut out);
        assert_eq!(out, [0, 1, 0, 2, 0, 3, 0x12, 0x34]);
        assert_eq!(
            Version::from_u16s([1, 2, 3, 0x1234]),
            Version::new(1, 2, 3, 0x1234)
        );
    }
}
