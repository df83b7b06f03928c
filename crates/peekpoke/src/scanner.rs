//! Needle searches over a tracee's address space.

use bytemuck::NoUninit;
use nix::errno::Errno;

use crate::editor::MemoryEditor;
use crate::error::{Error, Result};
use crate::guard::StopGuard;
use crate::region::{regions, Region};

/// Anything the scanner can search for.
pub trait Needle {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the needle matches a window of exactly `len()` bytes.
    fn matches(&self, window: &[u8]) -> bool;
}

impl Needle for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn matches(&self, window: &[u8]) -> bool {
        self == window
    }
}

impl<const N: usize> Needle for [u8; N] {
    fn len(&self) -> usize {
        N
    }

    fn matches(&self, window: &[u8]) -> bool {
        self == window
    }
}

/// Compiled wildcard pattern: byte values paired with wildcard flags.
///
/// A raw byte matches a pattern element iff the element is a wildcard
/// or the byte equals its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    items: Vec<(u8, bool)>,
}

impl Pattern {
    /// Compiles `pattern` against `mask`; position `i` is a wildcard
    /// iff `mask[i]` is `'*'`. The lengths must match.
    pub fn compile(pattern: &[u8], mask: &str) -> Result<Self> {
        if pattern.len() != mask.len() {
            return Err(Error::Argument(format!(
                "pattern length {} does not match mask length {}",
                pattern.len(),
                mask.len()
            )));
        }

        let items = pattern
            .iter()
            .zip(mask.bytes())
            .map(|(&value, flag)| (value, flag == b'*'))
            .collect();

        Ok(Self { items })
    }
}

impl Needle for Pattern {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn matches(&self, window: &[u8]) -> bool {
        self.items
            .iter()
            .zip(window)
            .all(|(&(value, wildcard), &byte)| wildcard || byte == value)
    }
}

/// Byte representation of a POD value, usable as a literal needle.
pub fn value_bytes<T: NoUninit>(value: &T) -> &[u8] {
    bytemuck::bytes_of(value)
}

/// Sweeps a tracee's memory regions for a needle.
pub struct Scanner<'t> {
    editor: MemoryEditor<'t>,
}

impl<'t> Scanner<'t> {
    pub fn new(editor: MemoryEditor<'t>) -> Self {
        Self { editor }
    }

    pub fn editor(&self) -> &MemoryEditor<'t> {
        &self.editor
    }

    /// Searches one region; a hit yields the absolute address.
    ///
    /// Device-backed regions the kernel refuses with EIO count as "no
    /// match" rather than an error.
    pub fn find_in_region<N>(&mut self, needle: &N, region: &Region) -> Result<Option<usize>>
    where
        N: Needle + ?Sized,
    {
        if needle.is_empty() || needle.len() > region.size() {
            return Ok(None);
        }

        let buffer = match self.read_region(region) {
            Ok(buffer) => buffer,
            Err(Error::Os {
                errno: Errno::EIO, ..
            }) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(search(&buffer, needle).map(|offset| region.start() + offset))
    }

    /// Sweeps every region, returning the first hit.
    pub fn find<N>(&mut self, needle: &N) -> Result<Option<usize>>
    where
        N: Needle + ?Sized,
    {
        for region in regions(self.editor.process())? {
            let region = region?;
            if let Some(addr) = self.find_in_region(needle, &region)? {
                return Ok(Some(addr));
            }
        }

        Ok(None)
    }

    /// Sweeps the regions whose permissions match `mask`.
    ///
    /// The mask has four positions over `r`, `w`, `x` and `s`/`p`.
    /// Each position is `*` (don't care) or a literal the region's
    /// permission character must equal, `-` meaning the permission
    /// must be absent.
    pub fn find_with_permissions<N>(&mut self, needle: &N, mask: &str) -> Result<Option<usize>>
    where
        N: Needle + ?Sized,
    {
        let mask = parse_permission_mask(mask)?;

        for region in regions(self.editor.process())? {
            let region = region?;
            if !mask_matches(&mask, &region) {
                continue;
            }

            if let Some(addr) = self.find_in_region(needle, &region)? {
                return Ok(Some(addr));
            }
        }

        Ok(None)
    }

    fn read_region(&mut self, region: &Region) -> Result<Vec<u8>> {
        // one guard across the whole region, so partial reads observe
        // the same stopped tracee
        let _guard = StopGuard::new(self.editor.tracer())?;

        let mut buffer = vec![0u8; region.size()];
        let mut filled = 0;

        while filled < buffer.len() {
            let n = self
                .editor
                .read_unguarded(region.start() + filled, &mut buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        buffer.truncate(filled);
        Ok(buffer)
    }
}

fn parse_permission_mask(mask: &str) -> Result<[u8; 4]> {
    let bytes: [u8; 4] = mask.as_bytes().try_into().map_err(|_| {
        Error::Argument(format!("permission mask must have 4 positions, got {mask:?}"))
    })?;

    let valid = matches!(bytes[0], b'r' | b'-' | b'*')
        && matches!(bytes[1], b'w' | b'-' | b'*')
        && matches!(bytes[2], b'x' | b'-' | b'*')
        && matches!(bytes[3], b's' | b'p' | b'-' | b'*');
    if !valid {
        return Err(Error::Argument(format!("invalid permission mask {mask:?}")));
    }

    Ok(bytes)
}

fn mask_matches(mask: &[u8; 4], region: &Region) -> bool {
    mask.iter()
        .zip(region.permissions())
        .all(|(&want, &have)| want == b'*' || want == have)
}

fn search<N: Needle + ?Sized>(buffer: &[u8], needle: &N) -> Option<usize> {
    if needle.is_empty() || needle.len() > buffer.len() {
        return None;
    }

    buffer
        .windows(needle.len())
        .position(|window| needle.matches(window))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_search_finds_the_first_occurrence() {
        let haystack = [0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x00];
        let needle = [0xDE, 0xAD, 0xBE, 0xEF];

        assert_eq!(search(&haystack, &needle), Some(1));
        assert_eq!(search(&haystack, &[0xEFu8, 0x01]), None);
        assert_eq!(search(&[0xDEu8, 0xAD], &needle), None);
    }

    #[test]
    fn wildcard_positions_match_any_byte() {
        // first byte wild, the rest literal
        let pattern = Pattern::compile(b"ABC", "*__").unwrap();

        assert_eq!(search(b"xABC", &pattern), Some(1));
        assert_eq!(search(b"xxBC", &pattern), Some(1));
        assert_eq!(search(b"ABD", &pattern), None);
    }

    #[test]
    fn all_wildcards_match_any_window_of_the_same_length() {
        let pattern = Pattern::compile(&[0, 0, 0], "***").unwrap();

        assert_eq!(search(&[9, 8, 7], &pattern), Some(0));
        assert_eq!(search(&[1, 2], &pattern), None);
    }

    #[test]
    fn no_wildcards_behaves_like_literal_search() {
        let pattern = Pattern::compile(b"BC", "__").unwrap();

        assert_eq!(search(b"ABCD", &pattern), Some(1));
        assert_eq!(search(b"ABCD", &b"BC"[..]), Some(1));
        assert_eq!(search(b"ABD", &pattern), None);
    }

    #[test]
    fn pattern_and_mask_lengths_must_agree() {
        assert!(matches!(
            Pattern::compile(b"ABC", "**"),
            Err(Error::Argument(_))
        ));
    }

    #[test]
    fn empty_needles_never_match() {
        assert_eq!(search(b"", &b""[..]), None);
        assert_eq!(search(b"abc", &b""[..]), None);
    }

    #[test]
    fn permission_masks_check_each_position() {
        let rxp = Region::parse("1000-2000 r-xp 00000000 00:00 0").unwrap();
        let rwxp = Region::parse("1000-2000 rwxp 00000000 00:00 0").unwrap();
        let rws = Region::parse("1000-2000 rw-s 00000000 00:00 0").unwrap();

        let mask = parse_permission_mask("r-x*").unwrap();
        assert!(mask_matches(&mask, &rxp));
        assert!(!mask_matches(&mask, &rwxp));

        let any = parse_permission_mask("****").unwrap();
        assert!(mask_matches(&any, &rxp));
        assert!(mask_matches(&any, &rwxp));
        assert!(mask_matches(&any, &rws));

        let shared = parse_permission_mask("**-s").unwrap();
        assert!(mask_matches(&shared, &rws));
        assert!(!mask_matches(&shared, &rxp));
    }

    #[test]
    fn permission_masks_are_validated() {
        assert!(matches!(
            parse_permission_mask("rwx"),
            Err(Error::Argument(_))
        ));
        assert!(matches!(
            parse_permission_mask("rwxps"),
            Err(Error::Argument(_))
        ));
        assert!(matches!(
            parse_permission_mask("qwxp"),
            Err(Error::Argument(_))
        ));
    }

    #[test]
    fn value_bytes_exposes_the_native_representation() {
        let value = 0xDEADBEEFu32;
        assert_eq!(value_bytes(&value), &value.to_ne_bytes());
    }
}
