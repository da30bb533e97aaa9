//! Oop maps and exception handler tables carried by compiled artifacts.
//!
//! An oop map records which frame slots and registers hold heap references at
//! one safepoint of the compiled code, so a collector can find roots in a
//! compiled frame stopped at that pc.

use std::collections::BTreeMap;

/// Reference locations live at one safepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OopMap {
    /// Offset of the safepoint in the instruction stream
    pub pc_offset: u32,
    /// Bit N set: frame slot N (8-byte units from sp) holds a reference
    pub frame_refs: u64,
    /// Bit N set: register N holds a reference
    pub register_refs: u32,
    /// Number of frame slots covered by `frame_refs`
    pub frame_slots: u16,
}

impl OopMap {
    pub fn new(pc_offset: u32, frame_slots: u16) -> Self {
        Self {
            pc_offset,
            frame_refs: 0,
            register_refs: 0,
            frame_slots,
        }
    }

    /// Mark a frame slot as holding a reference. Slots past 63 are not tracked.
    pub fn mark_frame_ref(&mut self, slot: usize) {
        if slot < 64 {
            self.frame_refs |= 1 << slot;
        }
    }

    pub fn mark_register_ref(&mut self, reg: u8) {
        if reg < 32 {
            self.register_refs |= 1 << reg;
        }
    }

    pub fn is_frame_ref(&self, slot: usize) -> bool {
        slot < 64 && (self.frame_refs & (1 << slot)) != 0
    }

    pub fn is_register_ref(&self, reg: u8) -> bool {
        reg < 32 && (self.register_refs & (1 << reg)) != 0
    }

    pub fn frame_ref_slots(&self) -> Vec<usize> {
        (0..self.frame_slots as usize)
            .filter(|&i| self.is_frame_ref(i))
            .collect()
    }
}

/// Oop maps of one artifact, keyed by safepoint offset.
#[derive(Debug, Clone, Default)]
pub struct OopMapSet {
    maps: BTreeMap<u32, OopMap>,
}

impl OopMapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, map: OopMap) {
        self.maps.insert(map.pc_offset, map);
    }

    /// The map recorded exactly at `pc_offset`.
    pub fn find(&self, pc_offset: u32) -> Option<&OopMap> {
        self.maps.get(&pc_offset)
    }

    /// The closest map at or before `pc_offset`.
    pub fn at_or_before(&self, pc_offset: u32) -> Option<&OopMap> {
        self.maps.range(..=pc_offset).next_back().map(|(_, m)| m)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OopMap> {
        self.maps.values()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

/// One entry of an artifact's exception handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Start of the covered range, inclusive
    pub start: u32,
    /// End of the covered range, exclusive
    pub end: u32,
    /// Offset of the handler code
    pub handler: u32,
}

/// Find the handler covering `pc_offset`; the first matching entry wins.
pub fn find_handler(handlers: &[ExceptionHandler], pc_offset: u32) -> Option<u32> {
    handlers
        .iter()
        .find(|h| (h.start..h.end).contains(&pc_offset))
        .map(|h| h.handler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oop_map_bits() {
        let mut map = OopMap::new(100, 4);
        map.mark_frame_ref(0);
        map.mark_frame_ref(3);
        map.mark_frame_ref(70);
        map.mark_register_ref(6);

        assert!(map.is_frame_ref(3));
        assert!(!map.is_frame_ref(1));
        assert!(!map.is_frame_ref(70));
        assert!(map.is_register_ref(6));
        assert_eq!(map.frame_ref_slots(), vec![0, 3]);
    }

    #[test]
    fn test_oop_map_lookup() {
        let mut set = OopMapSet::new();
        set.add(OopMap::new(0, 0));
        set.add(OopMap::new(20, 2));
        set.add(OopMap::new(50, 3));

        assert_eq!(set.find(20).unwrap().pc_offset, 20);
        assert!(set.find(25).is_none());
        assert_eq!(set.at_or_before(49).unwrap().pc_offset, 20);
        assert_eq!(set.at_or_before(100).unwrap().pc_offset, 50);
    }

    #[test]
    fn test_handler_lookup() {
        let handlers = [
            ExceptionHandler {
                start: 0,
                end: 16,
                handler: 64,
            },
            ExceptionHandler {
                start: 8,
                end: 32,
                handler: 80,
            },
        ];
        assert_eq!(find_handler(&handlers, 10), Some(64));
        assert_eq!(find_handler(&handlers, 16), Some(80));
        assert_eq!(find_handler(&handlers, 32), None);
    }
}
