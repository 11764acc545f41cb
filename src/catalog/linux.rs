//! Region enumeration backed by `/proc/self/maps`.

use std::fs;
use std::path::PathBuf;

use log::warn;
use region::Protection;

use super::{MemoryRegion, RegionKind};
use crate::addr::Address;

/// Reads every mapped region of the current process.
///
/// Lines that fail to parse are skipped; a missing or unreadable maps file
/// yields an empty catalog (logged, not fatal).
pub fn enumerate() -> Vec<MemoryRegion> {
    let maps = match fs::read_to_string("/proc/self/maps") {
        Ok(maps) => maps,
        Err(err) => {
            warn!("could not read /proc/self/maps: {err}");
            return Vec::new();
        }
    };
    maps.lines().filter_map(parse_line).collect()
}

/// Parses one maps line:
/// `55f0a000-55f0b000 r-xp 00000000 08:01 393228  /usr/bin/foo`.
fn parse_line(line: &str) -> Option<MemoryRegion> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _device = fields.next()?;
    let _inode = fields.next()?;
    // The pathname may contain spaces; recover it from the raw line.
    let path = fields.next().map(|first| {
        let start = line.find(first).unwrap_or(line.len() - first.len());
        line[start..].trim_end()
    });

    let (start, end) = range.split_once('-')?;
    let base = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;

    let mut protection = Protection::NONE;
    let mut perm_chars = perms.chars();
    if perm_chars.next()? == 'r' {
        protection |= Protection::READ;
    }
    if perm_chars.next()? == 'w' {
        protection |= Protection::WRITE;
    }
    if perm_chars.next()? == 'x' {
        protection |= Protection::EXECUTE;
    }
    let shared = perm_chars.next()? == 's';

    let kind = match path {
        Some(path) if path.starts_with('/') => {
            if shared {
                RegionKind::Other
            } else {
                RegionKind::Image(PathBuf::from(path))
            }
        }
        // The main heap and thread stacks are ordinary private anonymous
        // memory that happens to carry a label.
        Some("[heap]") | Some("[stack]") => RegionKind::Private,
        Some(_) => RegionKind::Other,
        None if shared => RegionKind::Other,
        None => RegionKind::Private,
    };

    Some(MemoryRegion {
        base: Address::new(base),
        size: end.checked_sub(base)?,
        protection,
        kind,
        committed: true,
        guarded: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_image_line() {
        let region = parse_line(
            "7f2c7a400000-7f2c7a5b0000 r-xp 00000000 08:01 393228   /usr/lib/libc.so.6",
        )
        .unwrap();
        assert_eq!(region.base, Address::new(0x7f2c_7a40_0000));
        assert_eq!(region.size, 0x1b0000);
        assert_eq!(region.protection, Protection::READ_EXECUTE);
        assert_eq!(
            region.kind,
            RegionKind::Image(PathBuf::from("/usr/lib/libc.so.6"))
        );
    }

    #[test]
    fn parses_anonymous_and_pseudo_lines() {
        let anon = parse_line("7f2c7a400000-7f2c7a500000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(anon.kind, RegionKind::Private);
        assert_eq!(anon.protection, Protection::READ_WRITE);

        let heap = parse_line("5630-5680 rw-p 00000000 00:00 0    [heap]").unwrap();
        assert_eq!(heap.kind, RegionKind::Private);

        let vvar = parse_line("7fff000-7fff100 r--p 00000000 00:00 0    [vvar]").unwrap();
        assert_eq!(vvar.kind, RegionKind::Other);

        let none = parse_line("8000-9000 ---p 00000000 00:00 0").unwrap();
        assert_eq!(none.protection, Protection::NONE);
    }

    #[test]
    fn enumerates_self() {
        let regions = enumerate();
        assert!(!regions.is_empty());
        // This function's own code must be inside one of the regions.
        let here = Address::new(enumerate as usize);
        assert!(regions
            .iter()
            .any(|r| r.base <= here && here < r.end() && r.protection.contains(Protection::EXECUTE)));
    }
}
