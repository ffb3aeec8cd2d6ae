use super::Translation;

pub const CACHE_SIZE: usize = 16384;
const MAX_ORIGINAL_BYTES: usize = 16;

#[derive(Clone)]
struct Entry {
    pc: u64,
    original: [u8; MAX_ORIGINAL_BYTES],
    original_len: u8,
    translation: Translation,
    access_count: u64,
    valid: bool,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            pc: 0,
            original: [0; MAX_ORIGINAL_BYTES],
            original_len: 0,
            translation: Translation::default(),
            access_count: 0,
            valid: false,
        }
    }
}

/// Direct-mapped, PC-indexed cache of finished translations. Replacement is
/// unconditional: a conflicting PC simply overwrites the slot.
pub struct TranslationCache {
    entries: Vec<Entry>,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self {
            entries: (0..CACHE_SIZE).map(|_| Entry::default()).collect(),
        }
    }

    fn index(pc: u64) -> usize {
        ((pc >> 4) % CACHE_SIZE as u64) as usize
    }

    pub fn lookup(&mut self, pc: u64) -> Option<&Translation> {
        let entry = &mut self.entries[Self::index(pc)];
        if entry.valid && entry.pc == pc {
            entry.access_count += 1;
            Some(&entry.translation)
        } else {
            None
        }
    }

    pub fn insert(&mut self, pc: u64, original: &[u8], translation: Translation) {
        let entry = &mut self.entries[Self::index(pc)];
        let keep = original.len().min(MAX_ORIGINAL_BYTES);
        entry.pc = pc;
        entry.original[..keep].copy_from_slice(&original[..keep]);
        entry.original[keep..].fill(0);
        entry.original_len = keep as u8;
        entry.translation = translation;
        entry.access_count = 1;
        entry.valid = true;
    }

    /// Bytes the cached translation was produced from.
    pub fn original_bytes(&self, pc: u64) -> Option<&[u8]> {
        let entry = &self.entries[Self::index(pc)];
        (entry.valid && entry.pc == pc)
            .then(|| &entry.original[..entry.original_len as usize])
    }

    pub fn flush(&mut self) {
        for entry in &mut self.entries {
            entry.valid = false;
        }
    }

    /// Invalidate every entry whose PC lies in `[start, start + size)`.
    /// Returns the number of entries dropped.
    pub fn invalidate_range(&mut self, start: u64, size: u64) -> usize {
        let end = start.saturating_add(size);
        let mut dropped = 0;
        for entry in &mut self.entries {
            if entry.valid && entry.pc >= start && entry.pc < end {
                entry.valid = false;
                dropped += 1;
            }
        }
        dropped
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(len: usize) -> Translation {
        Translation {
            bytes: vec![0x62; len],
            length: len,
            description: "test".into(),
            emulated: false,
            vector: false,
            overhead_cycles: 0,
        }
    }

    #[test]
    fn lookup_after_insert() {
        let mut cache = TranslationCache::new();
        assert!(cache.lookup(0x1000).is_none());
        cache.insert(0x1000, &[0x90], dummy(1));
        let t = cache.lookup(0x1000).expect("hit");
        assert_eq!(t.length, 1);
        assert_eq!(cache.original_bytes(0x1000).unwrap(), &[0x90]);
    }

    #[test]
    fn conflicting_pc_evicts() {
        let mut cache = TranslationCache::new();
        let a = 0x1000u64;
        // same index: (pc >> 4) differs by exactly CACHE_SIZE
        let b = a + ((CACHE_SIZE as u64) << 4);
        cache.insert(a, &[0x90], dummy(1));
        cache.insert(b, &[0xC3], dummy(2));
        assert!(cache.lookup(a).is_none());
        assert_eq!(cache.lookup(b).unwrap().length, 2);
    }

    #[test]
    fn flush_drops_everything() {
        let mut cache = TranslationCache::new();
        cache.insert(0x10, &[0x90], dummy(1));
        cache.insert(0x20, &[0x90], dummy(1));
        cache.flush();
        assert!(cache.lookup(0x10).is_none());
        assert!(cache.lookup(0x20).is_none());
    }

    #[test]
    fn range_invalidation_is_half_open() {
        let mut cache = TranslationCache::new();
        cache.insert(0x100, &[0x90], dummy(1));
        cache.insert(0x200, &[0x90], dummy(1));
        cache.insert(0x300, &[0x90], dummy(1));
        let dropped = cache.invalidate_range(0x100, 0x200);
        assert_eq!(dropped, 2);
        assert!(cache.lookup(0x100).is_none());
        assert!(cache.lookup(0x200).is_none());
        assert!(cache.lookup(0x300).is_some());
    }
}
