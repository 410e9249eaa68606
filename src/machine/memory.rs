//! The DCPU-16 memory subsystem: 64K words of backing storage, protected
//! regions that refuse writes, and mapped regions that hand reads and writes
//! over to a peripheral.

use std::io;
use std::sync::{Arc, Mutex};

use crate::machine::Error;

// NB. addresses are u16 as per the DCPU-16; lengths are usize to stop endless casting

/// The machine's sole numeric unit.
pub type Word = u16;

/// Number of words in the address space.
pub const MEMORY_SIZE: usize = 0x10000;

/// A half-open range `[start, start + length)` of word addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: Word,
    pub length: usize,
}

impl Region {
    pub fn new(start: Word, length: usize) -> Region {
        Region { start, length }
    }

    /// The first address not contained in the region.
    pub fn end(&self) -> usize {
        usize::from(self.start) + self.length
    }

    pub fn contains(&self, address: Word) -> bool {
        address >= self.start && usize::from(address) < self.end()
    }

    pub fn overlaps(&self, other: Region) -> bool {
        usize::from(self.start) < other.end() && usize::from(other.start) < self.end()
    }

    /// The smallest region containing both `self` and `other`.
    pub fn union(self, other: Region) -> Region {
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Region {
            start,
            length: end - usize::from(start),
        }
    }
}

/// A peripheral reachable through a mapped region. Offsets passed to the
/// callbacks are relative to the region start.
pub trait Device: Send {
    fn get(&self, offset: Word) -> Word;
    fn set(&mut self, offset: Word, value: Word) -> Result<(), Error>;
}

struct Mapping {
    region: Region,
    device: Arc<Mutex<dyn Device>>,
}

/// Backing storage plus the protected and mapped region lists.
///
/// Reads and writes inside a mapped region go to the peripheral; everywhere
/// else they go to backing storage. The protected list is kept sorted by
/// start address with overlapping or adjacent entries coalesced, so lookups
/// can bail out early.
pub struct Memory {
    ram: Box<[Word]>,
    protected: Vec<Region>,
    mapped: Vec<Mapping>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory {
            ram: vec![0; MEMORY_SIZE].into_boxed_slice(),
            protected: Vec::new(),
            mapped: Vec::new(),
        }
    }

    /// Read the word at `address`, dispatching to a peripheral when mapped.
    pub fn get(&self, address: Word) -> Word {
        match self.mapping_at(address) {
            Some(mapping) => mapping
                .device
                .lock()
                .unwrap()
                .get(address - mapping.region.start),
            None => self.ram[usize::from(address)],
        }
    }

    /// Write the word at `address`, dispatching to a peripheral when mapped.
    ///
    /// Protection is not checked here; the CPU store path is responsible for
    /// that, because only it can attach the faulting instruction context.
    pub fn set(&mut self, address: Word, value: Word) -> Result<(), Error> {
        match self.mapped.iter().find(|m| m.region.contains(address)) {
            Some(mapping) => mapping
                .device
                .lock()
                .unwrap()
                .set(address - mapping.region.start, value),
            None => {
                self.ram[usize::from(address)] = value;
                Ok(())
            }
        }
    }

    fn mapping_at(&self, address: Word) -> Option<&Mapping> {
        self.mapped.iter().find(|m| m.region.contains(address))
    }

    pub fn is_mapped(&self, address: Word) -> bool {
        self.mapping_at(address).is_some()
    }

    pub fn is_protected(&self, address: Word) -> bool {
        for region in &self.protected {
            if region.contains(address) {
                return true;
            }
            if region.start > address {
                break;
            }
        }
        false
    }

    /// Mark a region of backing storage as read-only for the program.
    /// Overlapping or adjacent regions are coalesced.
    pub fn protect(&mut self, region: Region) {
        self.protected.push(region);
        self.protected.sort_by_key(|r| r.start);
        let mut merged: Vec<Region> = Vec::with_capacity(self.protected.len());
        for region in self.protected.drain(..) {
            match merged.last_mut() {
                Some(last) if usize::from(region.start) <= last.end() => {
                    *last = last.union(region);
                }
                _ => merged.push(region),
            }
        }
        self.protected = merged;
    }

    /// The current protected regions, sorted and non-overlapping.
    pub fn protected(&self) -> &[Region] {
        &self.protected
    }

    /// Attach a peripheral to `[start, start + length)`. Fails when the
    /// region runs past the end of the address space or overlaps another
    /// mapped region or a protected region.
    pub fn map_region(
        &mut self,
        start: Word,
        length: usize,
        device: Arc<Mutex<dyn Device>>,
    ) -> Result<(), Error> {
        let region = Region::new(start, length);
        if region.end() > MEMORY_SIZE {
            return Err(Error::MapConflict { start, length });
        }
        if self.mapped.iter().any(|m| m.region.overlaps(region))
            || self.protected.iter().any(|r| r.overlaps(region))
        {
            return Err(Error::MapConflict { start, length });
        }
        log::debug!("mapping {} words at {:#06x}", length, start);
        self.mapped.push(Mapping { region, device });
        Ok(())
    }

    /// Detach the peripheral registered with exactly these bounds.
    pub fn unmap_region(&mut self, start: Word, length: usize) -> Result<(), Error> {
        let region = Region::new(start, length);
        match self.mapped.iter().position(|m| m.region == region) {
            Some(index) => {
                log::debug!("unmapping {} words at {:#06x}", length, start);
                self.mapped.remove(index);
                Ok(())
            }
            None => Err(Error::MapConflict { start, length }),
        }
    }

    /// Copy a compiled program into backing storage at `base`. Fails when the
    /// copy would run past the end of the address space or touch a protected
    /// or mapped region.
    pub fn load_program(&mut self, words: &[Word], base: Word) -> Result<(), Error> {
        let region = Region::new(base, words.len());
        if region.end() > MEMORY_SIZE
            || self.protected.iter().any(|r| r.overlaps(region))
            || self.mapped.iter().any(|m| m.region.overlaps(region))
        {
            return Err(Error::LoadRange {
                base,
                length: words.len(),
            });
        }
        let start = usize::from(base);
        self.ram[start..start + words.len()].copy_from_slice(words);
        Ok(())
    }

    /// Write a human-readable dump of backing storage to `sink`, bracketing
    /// the highlighted offsets. Runs of all-zero rows are elided.
    pub fn dump<W: io::Write>(&self, sink: &mut W, highlights: &[Word]) -> io::Result<()> {
        const WORDS_PER_ROW: usize = 8;
        let mut eliding = false;
        for row_start in (0..MEMORY_SIZE).step_by(WORDS_PER_ROW) {
            let row = &self.ram[row_start..row_start + WORDS_PER_ROW];
            let marked = highlights
                .iter()
                .any(|&h| usize::from(h) >= row_start && usize::from(h) < row_start + WORDS_PER_ROW);
            if !marked && row.iter().all(|&w| w == 0) {
                if !eliding {
                    writeln!(sink, "*")?;
                    eliding = true;
                }
                continue;
            }
            eliding = false;
            write!(sink, "{:#06x}:", row_start)?;
            for (i, &word) in row.iter().enumerate() {
                if highlights.contains(&((row_start + i) as Word)) {
                    write!(sink, " [{:04x}]", word)?;
                } else {
                    write!(sink, "  {:04x} ", word)?;
                }
            }
            writeln!(sink)?;
        }
        Ok(())
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A device backed by a small word array, for exercising the mapping
    /// dispatch without dragging a real peripheral in.
    struct TestDevice {
        words: [Word; 4],
        fail_writes: bool,
    }

    impl TestDevice {
        fn new() -> TestDevice {
            TestDevice {
                words: [0; 4],
                fail_writes: false,
            }
        }
    }

    impl Device for TestDevice {
        fn get(&self, offset: Word) -> Word {
            self.words[usize::from(offset)]
        }
        fn set(&mut self, offset: Word, value: Word) -> Result<(), Error> {
            if self.fail_writes {
                return Err(Error::Peripheral {
                    offset,
                    value,
                    message: "write refused".into(),
                });
            }
            self.words[usize::from(offset)] = value;
            Ok(())
        }
    }

    #[test]
    fn region_contains_is_half_open() {
        let region = Region::new(0x10, 0x10);
        assert!(!region.contains(0x0F));
        assert!(region.contains(0x10));
        assert!(region.contains(0x1F));
        assert!(!region.contains(0x20));
        assert_eq!(region.end(), 0x20);
    }

    #[test]
    fn region_union_spans_both() {
        let a = Region::new(0x10, 0x10);
        let b = Region::new(0x30, 0x08);
        assert_eq!(a.union(b), Region::new(0x10, 0x28));
        assert_eq!(b.union(a), Region::new(0x10, 0x28));
    }

    #[test]
    fn region_at_top_of_address_space() {
        let region = Region::new(0xFFF0, 0x10);
        assert!(region.contains(0xFFFF));
        assert_eq!(region.end(), MEMORY_SIZE);
    }

    #[test]
    fn protect_keeps_list_sorted_and_coalesced() {
        let mut memory = Memory::new();
        memory.protect(Region::new(0x30, 0x10));
        memory.protect(Region::new(0x10, 0x10));
        // adjacent to the first, overlapping the second
        memory.protect(Region::new(0x20, 0x18));
        assert_eq!(memory.protected(), &[Region::new(0x10, 0x30)]);
        assert!(memory.is_protected(0x25));
        assert!(!memory.is_protected(0x40));
    }

    #[test]
    fn reads_from_protected_regions_succeed() {
        let mut memory = Memory::new();
        memory.set(0x100, 0xBEEF).unwrap();
        memory.protect(Region::new(0x100, 0x10));
        assert_eq!(memory.get(0x100), 0xBEEF);
    }

    #[test]
    fn mapped_region_dispatches_to_device() {
        let mut memory = Memory::new();
        let device = Arc::new(Mutex::new(TestDevice::new()));
        memory.set(0x101, 0x1111).unwrap();
        memory.map_region(0x100, 4, device.clone()).unwrap();

        memory.set(0x101, 0xABCD).unwrap();
        assert_eq!(memory.get(0x101), 0xABCD);
        assert_eq!(device.lock().unwrap().words[1], 0xABCD);

        // the backing word underneath stays untouched
        memory.unmap_region(0x100, 4).unwrap();
        assert_eq!(memory.get(0x101), 0x1111);
    }

    #[test]
    fn mapped_write_failure_propagates() {
        let mut memory = Memory::new();
        let device = Arc::new(Mutex::new(TestDevice::new()));
        device.lock().unwrap().fail_writes = true;
        memory.map_region(0x100, 4, device).unwrap();
        assert!(matches!(
            memory.set(0x102, 1),
            Err(Error::Peripheral { offset: 2, .. })
        ));
    }

    #[test]
    fn map_region_rejects_conflicts() {
        let mut memory = Memory::new();
        memory.protect(Region::new(0x200, 0x10));
        let device = || Arc::new(Mutex::new(TestDevice::new()));

        // past the end of the address space
        assert!(matches!(
            memory.map_region(0xFFFE, 4, device()),
            Err(Error::MapConflict { .. })
        ));
        // overlapping a protected region
        assert!(matches!(
            memory.map_region(0x1FE, 4, device()),
            Err(Error::MapConflict { .. })
        ));
        // overlapping another mapped region
        memory.map_region(0x100, 4, device()).unwrap();
        assert!(matches!(
            memory.map_region(0x102, 4, device()),
            Err(Error::MapConflict { .. })
        ));
    }

    #[test]
    fn unmap_region_requires_exact_bounds() {
        let mut memory = Memory::new();
        let device = Arc::new(Mutex::new(TestDevice::new()));
        memory.map_region(0x100, 4, device).unwrap();
        assert!(memory.unmap_region(0x100, 2).is_err());
        assert!(memory.unmap_region(0x102, 4).is_err());
        assert!(memory.unmap_region(0x100, 4).is_ok());
        assert!(memory.unmap_region(0x100, 4).is_err());
    }

    #[test]
    fn load_program_copies_words() {
        let mut memory = Memory::new();
        memory.load_program(&[0x7C01, 0x0030], 0x200).unwrap();
        assert_eq!(memory.get(0x200), 0x7C01);
        assert_eq!(memory.get(0x201), 0x0030);
    }

    #[test]
    fn load_program_checks_range() {
        let mut memory = Memory::new();
        assert!(matches!(
            memory.load_program(&[1, 2, 3], 0xFFFE),
            Err(Error::LoadRange { base: 0xFFFE, .. })
        ));

        memory.protect(Region::new(0x100, 0x10));
        assert!(memory.load_program(&[1, 2], 0x10F).is_err());

        let device = Arc::new(Mutex::new(TestDevice::new()));
        memory.map_region(0x200, 4, device).unwrap();
        assert!(memory.load_program(&[1, 2], 0x1FF).is_err());
        assert!(memory.load_program(&[1, 2], 0x204).is_ok());
    }

    #[test]
    fn dump_brackets_highlights_and_elides_zeros() {
        let mut memory = Memory::new();
        memory.set(0x8, 0x1234).unwrap();
        let mut out = Vec::new();
        memory.dump(&mut out, &[0x8]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("0x0008: [1234]"));
        // the all-zero remainder collapses to elision markers
        assert!(text.lines().filter(|l| *l == "*").count() >= 1);
        assert!(!text.contains("0x0100:"));
    }
}
