use std::cmp;
use std::fmt;

use nonempty::NonEmpty;
use regex::Regex;

use crate::error::DfuError;

/// Memory layout announced by a DfuSe alternate setting name, e.g.
/// `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryMap {
    pub name: String,
    pub segments: NonEmpty<MemorySegment>,
}

/// A run of equally sized pages. `end_addr` is exclusive.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MemorySegment {
    start_addr: u32,
    end_addr: u32,
    page_size: u32,
    mem_type: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionOperation {
    Read,
    Write,
    Erase,
}

impl fmt::Display for RegionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RegionOperation::Read => "read",
            RegionOperation::Write => "write",
            RegionOperation::Erase => "erase",
        })
    }
}

impl MemoryMap {
    pub fn find_segments(
        &self,
        start_address: u32,
        end_address: u32,
    ) -> Vec<MemorySegment> {
        self.segments
            .iter()
            .filter(|s| s.overlaps(start_address, end_address))
            .cloned()
            .collect()
    }

    pub fn segment_at(&self, address: u32) -> Option<&MemorySegment> {
        self.segments.iter().find(|s| s.contains(address))
    }

    pub fn start_address(&self) -> u32 {
        self.segments.head.start_addr
    }

    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.size())).sum()
    }

    /// Verify that `[start, start + len)` is fully covered by segments that
    /// permit `operation`.
    pub fn check(
        &self,
        start: u32,
        len: usize,
        operation: RegionOperation,
    ) -> Result<(), DfuError> {
        self.split_range(start, len, operation).map(|_| ())
    }

    /// Page addresses to erase for `[start, start + len)`, ascending.
    pub fn erase_pages(
        &self,
        start: u32,
        len: usize,
    ) -> Result<Vec<u32>, DfuError> {
        let mut pages = Vec::new();
        for (addr, end, seg) in
            self.split_range(start, len, RegionOperation::Erase)?
        {
            seg.push_pages(addr, end, &mut pages);
        }
        Ok(pages)
    }

    /// Like [`MemoryMap::erase_pages`], but parts of the range lying in
    /// segments that cannot be erased (or in no segment at all) are
    /// skipped instead of rejected.
    pub fn erasable_pages(&self, start: u32, len: usize) -> Vec<u32> {
        let end = u64::from(start) + len as u64;
        let mut pages = Vec::new();
        for seg in self.segments.iter().filter(|s| s.erasable()) {
            let from = cmp::max(start, seg.start_addr);
            let to = cmp::min(end, u64::from(seg.end_addr));
            if u64::from(from) < to {
                seg.push_pages(from, to, &mut pages);
            }
        }
        pages.sort_unstable();
        pages
    }

    /// Cut `data` (to be written at `start`) at segment boundaries.
    pub fn split<'a>(
        &self,
        start: u32,
        data: &'a [u8],
    ) -> Result<Vec<(u32, &'a [u8])>, DfuError> {
        let mut offset = 0;
        let mut parts = Vec::new();
        for (addr, end, _) in
            self.split_range(start, data.len(), RegionOperation::Write)?
        {
            let n = (end - u64::from(addr)) as usize;
            parts.push((addr, &data[offset..offset + n]));
            offset += n;
        }
        Ok(parts)
    }

    fn split_range(
        &self,
        start: u32,
        len: usize,
        operation: RegionOperation,
    ) -> Result<Vec<(u32, u64, &MemorySegment)>, DfuError> {
        let end = u64::from(start) + cmp::max(len, 1) as u64;
        let mut addr = u64::from(start);
        let mut parts = Vec::new();
        while addr < end {
            let address = u32::try_from(addr).map_err(|_| {
                DfuError::UnsupportedRegion {
                    address: u32::MAX,
                    operation,
                }
            })?;
            let seg = self
                .segment_at(address)
                .filter(|s| s.permits(operation))
                .ok_or(DfuError::UnsupportedRegion { address, operation })?;
            let seg_end = cmp::min(end, u64::from(seg.end_addr));
            parts.push((address, seg_end, seg));
            addr = seg_end;
        }
        if len == 0 {
            parts.clear();
        }
        Ok(parts)
    }
}

impl fmt::Display for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Selected memory region: {} ({})",
            self.name,
            nice_size(self.total_size())
        )?;
        for seg in self.segments.iter() {
            write!(f, "\n{seg}")?;
        }
        Ok(())
    }
}

impl MemorySegment {
    pub fn start_addr(&self) -> u32 {
        self.start_addr
    }
    pub fn end_addr(&self) -> u32 {
        self.end_addr
    }
    pub fn page_size(&self) -> u32 {
        self.page_size
    }
    pub fn size(&self) -> u32 {
        self.end_addr - self.start_addr
    }
    pub fn pages(&self) -> u32 {
        self.size() / self.page_size
    }
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start_addr && addr < self.end_addr
    }
    pub fn overlaps(&self, start_addr: u32, end_addr: u32) -> bool {
        start_addr < self.end_addr && self.start_addr < end_addr
    }
    pub fn readable(&self) -> bool {
        self.mem_type & 1 == 1
    }
    pub fn erasable(&self) -> bool {
        self.mem_type & 2 == 2
    }
    pub fn writable(&self) -> bool {
        self.mem_type & 4 == 4
    }

    pub fn permits(&self, operation: RegionOperation) -> bool {
        match operation {
            RegionOperation::Read => self.readable(),
            RegionOperation::Write => self.writable(),
            RegionOperation::Erase => self.erasable(),
        }
    }

    fn page_start(&self, addr: u32) -> u32 {
        let offset = addr - self.start_addr;
        self.start_addr + offset / self.page_size * self.page_size
    }

    /// Append the start of every page overlapping `[addr, end)`.
    fn push_pages(&self, addr: u32, end: u64, pages: &mut Vec<u32>) {
        let mut page = self.page_start(addr);
        while u64::from(page) < end {
            pages.push(page);
            match page.checked_add(self.page_size) {
                Some(next) => page = next,
                None => break,
            }
        }
    }
}

impl fmt::Display for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let properties: Vec<&str> = [
            (self.readable(), "readable"),
            (self.erasable(), "erasable"),
            (self.writable(), "writable"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        let properties = if properties.is_empty() {
            "inaccessible".to_string()
        } else {
            properties.join(", ")
        };
        write!(
            f,
            "{:#010x}-{:#010x} ({properties})",
            self.start_addr,
            self.end_addr - 1
        )
    }
}

/// Human readable size with binary prefixes (`64KiB`, `1.5MiB`).
pub fn nice_size(n: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    let (unit, div) = match n {
        n if n >= GIB => ("GiB", GIB),
        n if n >= MIB => ("MiB", MIB),
        n if n >= KIB => ("KiB", KIB),
        _ => return format!("{n}B"),
    };
    format!("{}{unit}", n as f64 / div as f64)
}

pub fn parse_memory_layout(mem_layout_str: &str) -> Option<MemoryMap> {
    let r = Regex::new(r"^@?([^/]*?)\s*(/0x.*)$").ok()?;
    let captures = r.captures(mem_layout_str.trim())?;
    let name = String::from(&captures[1]);

    let gr = Regex::new(r"/0x([\da-fA-F]+)U?/([^/]*)").ok()?;
    let sr = Regex::new(r"(\d+)\*(\d+)([KMB ]?)([a-g])(?:,|$)").ok()?;

    let mut layout = Vec::new();
    for group in gr.captures_iter(&captures[2]) {
        let mut current_addr = u32::from_str_radix(&group[1], 16).ok()?;

        for seg_match in sr.captures_iter(group[2].trim()) {
            let pages: u32 = seg_match[1].parse().ok()?;
            let mut page_size: u32 = seg_match[2].parse().ok()?;
            match &seg_match[3] {
                "K" => page_size = page_size.checked_mul(1024)?,
                "M" => page_size = page_size.checked_mul(1024 * 1024)?,
                _ => {}
            }
            if pages == 0 || page_size == 0 {
                continue;
            }

            let mem_type = seg_match[4].as_bytes()[0] & 7;
            let end_addr =
                current_addr.checked_add(pages.checked_mul(page_size)?)?;

            layout.push(MemorySegment {
                start_addr: current_addr,
                end_addr,
                page_size,
                mem_type,
            });
            current_addr = end_addr;
        }
    }

    NonEmpty::from_vec(layout).map(|segments| MemoryMap { name, segments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonempty::nonempty;

    fn segment(start: u32, end: u32, page_size: u32, t: u8) -> MemorySegment {
        MemorySegment {
            start_addr: start,
            end_addr: end,
            page_size,
            mem_type: t & 7,
        }
    }

    #[test]
    fn test_memory_layout() {
        let layout =
            parse_memory_layout("@Option Bytes   /0x5200201C/01*128 e");
        assert_eq!(
            layout,
            Some(MemoryMap {
                name: "Option Bytes".into(),
                segments: nonempty![segment(
                    0x5200201C,
                    0x5200201C + 128,
                    128,
                    b'e'
                )],
            })
        );

        let layout =
            parse_memory_layout("@Internal Flash   /0x08000000/8*08Kg");
        assert_eq!(
            layout,
            Some(MemoryMap {
                name: "Internal Flash".into(),
                segments: nonempty![segment(
                    0x08000000,
                    0x08000000 + 64 * 1024,
                    8 * 1024,
                    b'g'
                )],
            })
        );
    }

    #[test]
    fn test_multi_segment_layout() {
        let layout = parse_memory_layout(
            "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg",
        )
        .unwrap();
        assert_eq!(layout.segments.len(), 3);
        assert_eq!(layout.segments[1].start_addr(), 0x08010000);
        assert_eq!(layout.segments[2].end_addr(), 0x08100000);
        assert_eq!(layout.total_size(), 1024 * 1024);
        assert_eq!(
            layout.to_string(),
            "Selected memory region: Internal Flash (1MiB)\n\
             0x08000000-0x0800ffff (readable, erasable, writable)\n\
             0x08010000-0x0801ffff (readable, erasable, writable)\n\
             0x08020000-0x080fffff (readable, erasable, writable)"
        );

        let layout = parse_memory_layout(
            "@SRAM /0x20000000/64*001Kg/0x10000000/1*512 a",
        )
        .unwrap();
        assert_eq!(layout.segments.len(), 2);
        assert_eq!(layout.segments[1].start_addr(), 0x10000000);
        assert!(layout.segments[1].readable());
        assert!(!layout.segments[1].writable());

        assert_eq!(parse_memory_layout("Bootloader"), None);
    }

    #[test]
    fn test_region_checks() {
        // writable but not erasable
        let map = MemoryMap {
            name: "Flash".into(),
            segments: nonempty![segment(0x08000000, 0x08004000, 1024, b'e')],
        };
        assert!(matches!(
            map.check(0x08000000, 0x4000, RegionOperation::Erase),
            Err(DfuError::UnsupportedRegion {
                address: 0x08000000,
                operation: RegionOperation::Erase
            })
        ));
        assert!(map.check(0x08000000, 0x4000, RegionOperation::Write).is_ok());
        assert!(map.check(0x08000000, 0x4000, RegionOperation::Read).is_ok());

        // one byte past the end
        assert!(matches!(
            map.check(0x08003fff, 2, RegionOperation::Write),
            Err(DfuError::UnsupportedRegion {
                address: 0x08004000,
                ..
            })
        ));
    }

    #[test]
    fn test_erase_pages_and_split() {
        let map = parse_memory_layout(
            "@Internal Flash  /0x08000000/04*016Kg,01*064Kg",
        )
        .unwrap();
        assert_eq!(
            map.erase_pages(0x08002000, 0x10000).unwrap(),
            vec![0x08000000, 0x08004000, 0x08008000, 0x0800c000, 0x08010000]
        );
        assert!(map.erase_pages(0x08000000, 0).unwrap().is_empty());

        let data = vec![0u8; 0x100];
        let parts = map.split(0x0800ff80, &data).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, 0x0800ff80);
        assert_eq!(parts[0].1.len(), 0x80);
        assert_eq!(parts[1].0, 0x08010000);
        assert_eq!(parts[1].1.len(), 0x80);

        assert_eq!(map.find_segments(0x0800ff80, 0x08010080).len(), 2);
    }

    #[test]
    fn test_erasable_pages_skip_write_only_segments() {
        let map = parse_memory_layout("@Flash /0x08000000/02*1Kg,02*1Ke")
            .unwrap();
        assert!(map.erase_pages(0x08000000, 0x1000).is_err());
        assert_eq!(
            map.erasable_pages(0x08000200, 0x1000),
            vec![0x08000000, 0x08000400]
        );
        assert!(map.erasable_pages(0x08000800, 0x800).is_empty());
        assert!(map.erasable_pages(0x08000000, 0).is_empty());
    }

    #[test]
    fn test_nice_size() {
        assert_eq!(nice_size(512), "512B");
        assert_eq!(nice_size(64 * 1024), "64KiB");
        assert_eq!(nice_size(1536 * 1024), "1.5MiB");
        assert_eq!(nice_size(2 * 1024 * 1024 * 1024), "2GiB");
    }
}
