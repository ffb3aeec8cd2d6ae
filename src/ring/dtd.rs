use std::collections::HashMap;

use log::trace;

use crate::arch::CACHE_LINE_SIZE;

const DIRECTORY_CAPACITY: usize = 1024;

/// Reduced M/E/S line state. Mutual exclusion of the three states falls out
/// of the representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Modified,
    Exclusive,
    Shared,
}

#[derive(Debug, Clone)]
pub struct CacheLine {
    pub address: u64,
    pub owner: usize,
    pub sharers: u64,
    pub state: LineState,
    pub last_access: u64,
}

impl CacheLine {
    fn single_owner(address: u64, owner: usize, state: LineState, now: u64) -> Self {
        Self {
            address,
            owner,
            sharers: 1 << owner,
            state,
            last_access: now,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DirectoryStats {
    pub snoop_requests: u64,
    pub invalidation_requests: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Directory slice homed at one tile, hash-indexed by line address.
pub struct TileDirectory {
    pub tile_id: usize,
    lines: HashMap<u64, CacheLine>,
    capacity: usize,
    pub stats: DirectoryStats,
}

impl TileDirectory {
    fn new(tile_id: usize) -> Self {
        Self {
            tile_id,
            lines: HashMap::with_capacity(DIRECTORY_CAPACITY),
            capacity: DIRECTORY_CAPACITY,
            stats: DirectoryStats::default(),
        }
    }

    fn insert(&mut self, line: CacheLine) {
        if self.lines.len() >= self.capacity && !self.lines.contains_key(&line.address) {
            // evict the least recently touched entry
            if let Some(&victim) = self
                .lines
                .iter()
                .min_by_key(|(_, l)| l.last_access)
                .map(|(addr, _)| addr)
            {
                self.lines.remove(&victim);
            }
        }
        self.lines.insert(line.address, line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Outcome of a coherency consult on the send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherencyAction {
    /// Extra ring hops charged by the directory walk.
    pub extra_hops: u64,
    /// When a write-back is required, the message detours via the home tile.
    pub redirect_home: Option<usize>,
}

impl CoherencyAction {
    fn clean() -> Self {
        Self {
            extra_hops: 0,
            redirect_home: None,
        }
    }
}

/// Distributed tag directory: one slice per tile, lines homed by address.
pub struct TagDirectory {
    tiles: Vec<TileDirectory>,
}

impl TagDirectory {
    pub fn new(num_tiles: usize) -> Self {
        Self {
            tiles: (0..num_tiles).map(TileDirectory::new).collect(),
        }
    }

    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Home tile for a line. Hashed on the aligned line address so every
    /// byte of a line homes to the same tile.
    pub fn home_of(&self, address: u64) -> usize {
        (Self::align(address) % self.tiles.len() as u64) as usize
    }

    pub fn align(address: u64) -> u64 {
        address & !(CACHE_LINE_SIZE - 1)
    }

    pub fn lookup(&self, address: u64) -> Option<&CacheLine> {
        let home = self.home_of(address);
        self.tiles[home].lines.get(&Self::align(address))
    }

    pub fn tile_stats(&self, tile: usize) -> Option<&DirectoryStats> {
        self.tiles.get(tile).map(|t| &t.stats)
    }

    /// True when `tile` may touch `address` without any coherency traffic.
    pub fn check_coherency(&self, address: u64, tile: usize) -> bool {
        match self.lookup(address) {
            None => true,
            Some(line) => line.owner == tile || line.state != LineState::Modified,
        }
    }

    /// Register `owner` as the single holder of the line. A modified line is
    /// recorded Modified; a clean single owner is Exclusive.
    pub fn update_ownership(&mut self, address: u64, owner: usize, modified: bool, now: u64) {
        let home = self.home_of(address);
        let aligned = Self::align(address);
        let state = if modified {
            LineState::Modified
        } else {
            LineState::Exclusive
        };
        let dir = &mut self.tiles[home];
        match dir.lines.get_mut(&aligned) {
            Some(line) => {
                line.owner = owner;
                line.sharers = 1 << owner;
                line.state = state;
                line.last_access = now;
            }
            None => dir.insert(CacheLine::single_owner(aligned, owner, state, now)),
        }
    }

    /// Strip `requester` from the sharer set and hand it ownership; counted
    /// against the home tile.
    pub fn invalidate_line(&mut self, address: u64, requester: usize, now: u64) {
        let home = self.home_of(address);
        let aligned = Self::align(address);
        let dir = &mut self.tiles[home];
        if let Some(line) = dir.lines.get_mut(&aligned) {
            line.sharers &= !(1u64 << requester);
            line.owner = requester;
            line.last_access = now;
            dir.stats.invalidation_requests += 1;
        }
    }

    /// Full send-path consult for `(address, tile)`. Applies the directory
    /// transition and returns the latency/redirect consequences:
    ///
    /// miss -> allocate to requester, +2; shared/exclusive transfer, +1;
    /// modified by another tile -> write-back via the home, +3.
    pub fn consult(
        &mut self,
        address: u64,
        tile: usize,
        is_write: bool,
        now: u64,
    ) -> CoherencyAction {
        let home = self.home_of(address);
        let aligned = Self::align(address);

        let hit = self.tiles[home].lines.contains_key(&aligned);
        if !hit {
            self.tiles[home].stats.misses += 1;
            self.update_ownership(address, tile, is_write, now);
            return CoherencyAction {
                extra_hops: 2,
                redirect_home: None,
            };
        }

        self.tiles[home].stats.hits += 1;
        let line = self.tiles[home]
            .lines
            .get_mut(&aligned)
            .expect("hit just checked");
        line.last_access = now;

        if line.owner == tile {
            return CoherencyAction::clean();
        }

        match line.state {
            LineState::Shared => {
                line.sharers |= 1 << tile;
                CoherencyAction {
                    extra_hops: 1,
                    redirect_home: None,
                }
            }
            LineState::Exclusive => {
                line.owner = tile;
                line.sharers = 1 << tile;
                CoherencyAction {
                    extra_hops: 1,
                    redirect_home: None,
                }
            }
            LineState::Modified => {
                trace!(
                    "dtd: write-back of {:#x} for tile {} via home {}",
                    aligned,
                    tile,
                    home
                );
                self.tiles[home].stats.snoop_requests += 1;
                self.invalidate_line(address, tile, now);
                self.update_ownership(address, tile, true, now);
                CoherencyAction {
                    extra_hops: 3,
                    redirect_home: Some(home),
                }
            }
        }
    }

    pub fn reset(&mut self) {
        for dir in &mut self.tiles {
            dir.lines.clear();
            dir.stats = DirectoryStats::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_allocates_exclusive_to_requester() {
        let mut dtd = TagDirectory::new(4);
        let action = dtd.consult(0x1040, 2, false, 0);
        assert_eq!(action.extra_hops, 2);
        assert_eq!(action.redirect_home, None);
        let line = dtd.lookup(0x1040).unwrap();
        assert_eq!(line.owner, 2);
        assert_eq!(line.state, LineState::Exclusive);
        assert_eq!(line.sharers, 1 << 2);
    }

    #[test]
    fn owner_access_is_free() {
        let mut dtd = TagDirectory::new(4);
        dtd.update_ownership(0x2000, 1, true, 0);
        let action = dtd.consult(0x2000, 1, true, 1);
        assert_eq!(action.extra_hops, 0);
        assert_eq!(action.redirect_home, None);
    }

    #[test]
    fn shared_line_adds_requester() {
        let mut dtd = TagDirectory::new(4);
        dtd.update_ownership(0x2000, 1, false, 0);
        // force Shared state
        let home = dtd.home_of(0x2000);
        dtd.tiles[home]
            .lines
            .get_mut(&TagDirectory::align(0x2000))
            .unwrap()
            .state = LineState::Shared;

        let action = dtd.consult(0x2000, 3, false, 1);
        assert_eq!(action.extra_hops, 1);
        let line = dtd.lookup(0x2000).unwrap();
        assert_eq!(line.state, LineState::Shared);
        assert_eq!(line.sharers, (1 << 1) | (1 << 3));
    }

    #[test]
    fn exclusive_transfer_moves_ownership() {
        let mut dtd = TagDirectory::new(4);
        dtd.update_ownership(0x2000, 1, false, 0);
        let action = dtd.consult(0x2000, 3, false, 1);
        assert_eq!(action.extra_hops, 1);
        let line = dtd.lookup(0x2000).unwrap();
        assert_eq!(line.owner, 3);
        assert_eq!(line.sharers, 1 << 3);
        assert_eq!(line.state, LineState::Exclusive);
    }

    #[test]
    fn modified_by_other_tile_forces_writeback() {
        let mut dtd = TagDirectory::new(4);
        dtd.update_ownership(0x1000, 0, true, 0);
        assert!(!dtd.check_coherency(0x1000, 3));

        let home = dtd.home_of(0x1000);
        let action = dtd.consult(0x1000, 3, true, 5);
        assert_eq!(action.extra_hops, 3);
        assert_eq!(action.redirect_home, Some(home));

        let line = dtd.lookup(0x1000).unwrap();
        assert_eq!(line.owner, 3);
        assert_eq!(line.state, LineState::Modified);
        assert_eq!(line.sharers, 1 << 3);
        assert_eq!(dtd.tile_stats(home).unwrap().invalidation_requests, 1);
        assert_eq!(dtd.tile_stats(home).unwrap().snoop_requests, 1);
    }

    #[test]
    fn modified_implies_single_sharer() {
        let mut dtd = TagDirectory::new(8);
        for tile in 0..8 {
            dtd.consult(0x4000 + tile as u64 * 64, tile, true, tile as u64);
        }
        for tile in 0..8 {
            if let Some(line) = dtd.lookup(0x4000 + tile as u64 * 64) {
                if line.state == LineState::Modified {
                    assert_eq!(line.sharers.count_ones(), 1);
                    assert_eq!(line.sharers, 1 << line.owner);
                }
            }
        }
    }

    #[test]
    fn lines_are_cache_line_aligned() {
        let mut dtd = TagDirectory::new(4);
        dtd.update_ownership(0x1037, 1, false, 0);
        assert_eq!(TagDirectory::align(0x1037), 0x1000);
        // any byte in the line resolves to the same entry
        assert_eq!(dtd.lookup(0x1000).unwrap().owner, 1);
        assert_eq!(dtd.lookup(0x103F).unwrap().owner, 1);
    }

    #[test]
    fn directory_bounded_by_capacity() {
        let mut dtd = TagDirectory::new(1);
        for i in 0..(DIRECTORY_CAPACITY as u64 + 100) {
            dtd.update_ownership(i * 64, 0, false, i);
        }
        assert_eq!(dtd.tiles[0].len(), DIRECTORY_CAPACITY);
    }
}
