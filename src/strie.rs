//! A packed multi-string trie, used to store and search large sets of
//! literal URL-fragment patterns.
//!
//! A [`TrieContainer`] is mostly one large buffer in which distinct but
//! related tries are stored. Trie cells live in a flat `u32` arena, three
//! words per cell:
//!
//! ```text
//!   +--------------+
//!   | Down         |  alternative branch at the same position
//!   +--------------+
//!   | Right        |  next segment, once this one has matched
//!   +--------------+
//!   | Segment      |  top 8 bits: length; low 24 bits: char-data offset
//!   +--------------+
//! ```
//!
//! A cell whose segment word is zero is a boundary marker: a stored pattern
//! ends at that position. Character data for all tries is co-located in one
//! append-only byte region, so the whole container serializes as a single
//! blob and reloads without per-pattern reconstruction.

use serde::{Deserialize, Serialize};

const CELL_DOWN: usize = 0;
const CELL_RIGHT: usize = 1;
const CELL_SEG: usize = 2;
const CELL_SIZE: usize = 3;

const SEG_LEN_MAX: usize = 0xFF;
const CHAR_OFFSET_MAX: usize = 0x00FF_FFFF;

// Buffers grow by page-sized increments, and are compacted in `optimize()`.
const PAGE_SIZE: usize = 65536;

/// Reference to one trie within a [`TrieContainer`]: a root cell index plus
/// the number of stored patterns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrieRef {
    iroot: u32,
    size: u32,
}

impl TrieRef {
    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrieContainer {
    cells: Vec<u32>,
    chars: Vec<u8>,
}

impl Default for TrieContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl TrieContainer {
    pub fn new() -> Self {
        // Cell index 0 is reserved as the null link.
        TrieContainer {
            cells: vec![0; CELL_SIZE],
            chars: Vec::new(),
        }
    }

    /// Allocate a fresh, empty trie in this container.
    pub fn create_one(&mut self) -> TrieRef {
        let iroot = self.alloc_cell(0, 0, 0);
        TrieRef { iroot, size: 0 }
    }

    /// Insert `pattern` into the trie referenced by `trie`. Returns false if
    /// the pattern was already present, or empty. Buffer growth is handled
    /// internally; there is no error path.
    pub fn add(&mut self, trie: &mut TrieRef, pattern: &str) -> bool {
        let bytes = pattern.as_bytes();
        if bytes.is_empty() {
            return false;
        }
        if self.chars.len() + bytes.len() > CHAR_OFFSET_MAX {
            // Char-data offsets are 24-bit; a container this full cannot
            // accept more patterns.
            return false;
        }
        let iroot = trie.iroot as usize;

        // Virgin trie: the root cell holds the first segment directly.
        if self.seg(iroot) == 0 && self.down(iroot) == 0 && self.right(iroot) == 0 {
            self.fill_chain(iroot, bytes);
            trie.size += 1;
            return true;
        }

        let mut icell = iroot;
        let mut cursor = 0usize;
        loop {
            // Scan the sibling chain at this position.
            let mut matched = 0usize;
            let mut has_boundary = false;
            let mut last = icell;
            let mut i = icell;
            while i != 0 {
                let seg = self.cells[i + CELL_SEG];
                if seg == 0 {
                    has_boundary = true;
                } else if cursor < bytes.len() {
                    let off = (seg & CHAR_OFFSET_MAX as u32) as usize;
                    if self.chars[off] == bytes[cursor] {
                        matched = i;
                    }
                }
                last = i;
                i = self.down(i);
            }

            // Pattern exhausted at this position: it needs a boundary cell,
            // unless one is already there (pattern already present).
            if cursor == bytes.len() {
                if has_boundary {
                    return false;
                }
                let b = self.alloc_cell(0, 0, 0);
                self.set_down(last, b);
                trie.size += 1;
                return true;
            }

            // No sibling starts with the next character: new branch.
            if matched == 0 {
                let branch = self.new_chain(&bytes[cursor..]);
                self.set_down(last, branch);
                trie.size += 1;
                return true;
            }

            // Compare the rest of the matched segment.
            let seg = self.cells[matched + CELL_SEG];
            let len = (seg >> 24) as usize;
            let off = (seg & CHAR_OFFSET_MAX as u32) as usize;
            let mut k = 1;
            cursor += 1;
            while k < len && cursor < bytes.len() && self.chars[off + k] == bytes[cursor] {
                k += 1;
                cursor += 1;
            }

            if k == len {
                // Whole segment matched.
                let next = self.right(matched) as usize;
                if next != 0 {
                    icell = next;
                    continue;
                }
                if cursor == bytes.len() {
                    // Exact pattern already stored, ending implicitly here.
                    return false;
                }
                // Extend: the stored pattern's implicit end becomes an
                // explicit boundary, sibling of the new remainder.
                let rem = self.new_chain(&bytes[cursor..]);
                let b = self.alloc_cell(rem, 0, 0);
                self.set_right(matched, b);
                trie.size += 1;
                return true;
            }

            // Partial segment match: split so the common prefix is shared.
            let suffix_seg = Self::pack_seg(off + k, len - k);
            self.cells[matched + CELL_SEG] = Self::pack_seg(off, k);
            let old_right = self.right(matched);
            let isuffix = self.alloc_cell(0, old_right, suffix_seg);
            if cursor == bytes.len() {
                // New pattern ends at the split point.
                let b = self.alloc_cell(isuffix, 0, 0);
                self.set_right(matched, b);
            } else {
                let rem = self.new_chain(&bytes[cursor..]);
                self.set_down(isuffix as usize, rem);
                self.set_right(matched, isuffix);
            }
            trie.size += 1;
            return true;
        }
    }

    /// Match `haystack` starting at `from` against the trie. Returns the
    /// offset immediately past the longest stored pattern matching there,
    /// or -1 if none does.
    pub fn matches(&self, trie: &TrieRef, haystack: &[u8], from: usize) -> i32 {
        let iroot = trie.iroot as usize;
        if self.seg(iroot) == 0 && self.down(iroot) == 0 && self.right(iroot) == 0 {
            return -1;
        }
        let mut icell = iroot;
        let mut cursor = from;
        let mut best: i32 = -1;
        loop {
            // Scan the sibling chain: record any boundary (a stored pattern
            // ends here), and find the segment matching the next character.
            let mut matched = 0usize;
            let mut i = icell;
            while i != 0 {
                let seg = self.cells[i + CELL_SEG];
                if seg == 0 {
                    best = cursor as i32;
                } else if cursor < haystack.len() {
                    let off = (seg & CHAR_OFFSET_MAX as u32) as usize;
                    if self.chars[off] == haystack[cursor] {
                        matched = i;
                    }
                }
                i = self.down(i);
            }
            if matched == 0 {
                return best;
            }
            // All characters of the segment must match.
            let seg = self.cells[matched + CELL_SEG];
            let len = (seg >> 24) as usize;
            let off = (seg & CHAR_OFFSET_MAX as u32) as usize;
            if cursor + len > haystack.len()
                || haystack[cursor..cursor + len] != self.chars[off..off + len]
            {
                return best;
            }
            cursor += len;
            let next = self.right(matched) as usize;
            if next == 0 {
                // Implicit pattern end, nothing longer stored beyond it.
                return cursor as i32;
            }
            icell = next;
        }
    }

    /// All patterns stored in one trie, mainly for diagnostics and tests.
    pub fn patterns(&self, trie: &TrieRef) -> Vec<String> {
        let mut out = Vec::with_capacity(trie.len());
        let iroot = trie.iroot as usize;
        if self.seg(iroot) == 0 && self.down(iroot) == 0 && self.right(iroot) == 0 {
            return out;
        }
        let mut buf = Vec::new();
        self.collect_patterns(iroot, &mut buf, &mut out);
        out
    }

    fn collect_patterns(&self, chain: usize, buf: &mut Vec<u8>, out: &mut Vec<String>) {
        let mut i = chain;
        while i != 0 {
            let seg = self.cells[i + CELL_SEG];
            if seg == 0 {
                out.push(String::from_utf8_lossy(buf).into_owned());
            } else {
                let len = (seg >> 24) as usize;
                let off = (seg & CHAR_OFFSET_MAX as u32) as usize;
                let depth = buf.len();
                buf.extend_from_slice(&self.chars[off..off + len]);
                let next = self.right(i) as usize;
                if next == 0 {
                    out.push(String::from_utf8_lossy(buf).into_owned());
                } else {
                    self.collect_patterns(next, buf, out);
                }
                buf.truncate(depth);
            }
            i = self.down(i);
        }
    }

    /// Compact the underlying buffers after all insertions are done.
    pub fn optimize(&mut self) {
        self.cells.shrink_to_fit();
        self.chars.shrink_to_fit();
    }

    /// Discard all tries. Outstanding [`TrieRef`]s become invalid.
    pub fn reset(&mut self) {
        self.cells.clear();
        self.cells.resize(CELL_SIZE, 0);
        self.chars.clear();
    }

    /// The whole container as one contiguous blob.
    pub fn serialize(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Rebuild a container from [`TrieContainer::serialize`] output.
    pub fn unserialize(buf: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(buf)
    }

    //
    // Cell arena primitives
    //

    fn seg(&self, icell: usize) -> u32 {
        self.cells[icell + CELL_SEG]
    }

    fn down(&self, icell: usize) -> usize {
        self.cells[icell + CELL_DOWN] as usize
    }

    fn right(&self, icell: usize) -> u32 {
        self.cells[icell + CELL_RIGHT]
    }

    fn set_down(&mut self, icell: usize, v: u32) {
        self.cells[icell + CELL_DOWN] = v;
    }

    fn set_right(&mut self, icell: usize, v: u32) {
        self.cells[icell + CELL_RIGHT] = v;
    }

    fn alloc_cell(&mut self, down: u32, right: u32, seg: u32) -> u32 {
        if self.cells.len() + CELL_SIZE > self.cells.capacity() {
            self.cells.reserve(PAGE_SIZE / 4);
        }
        let icell = self.cells.len() as u32;
        self.cells.push(down);
        self.cells.push(right);
        self.cells.push(seg);
        icell
    }

    fn pack_seg(off: usize, len: usize) -> u32 {
        debug_assert!(len > 0 && len <= SEG_LEN_MAX && off <= CHAR_OFFSET_MAX);
        ((len as u32) << 24) | (off as u32)
    }

    fn store_seg(&mut self, bytes: &[u8]) -> u32 {
        if self.chars.len() + bytes.len() > self.chars.capacity() {
            self.chars.reserve(PAGE_SIZE);
        }
        let off = self.chars.len();
        self.chars.extend_from_slice(bytes);
        Self::pack_seg(off, bytes.len())
    }

    /// Write `bytes` into `icell`, chaining extra cells via the right link
    /// when the segment exceeds the 8-bit length field.
    fn fill_chain(&mut self, icell: usize, bytes: &[u8]) {
        let take = bytes.len().min(SEG_LEN_MAX);
        let seg = self.store_seg(&bytes[..take]);
        self.cells[icell + CELL_SEG] = seg;
        if take < bytes.len() {
            let next = self.new_chain(&bytes[take..]);
            self.set_right(icell, next);
        }
    }

    /// A fresh cell chain holding `bytes` as one or more segments.
    fn new_chain(&mut self, bytes: &[u8]) -> u32 {
        let icell = self.alloc_cell(0, 0, 0);
        self.fill_chain(icell as usize, bytes);
        icell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie_from(patterns: &[&str]) -> (TrieContainer, TrieRef) {
        let mut container = TrieContainer::new();
        let mut trie = container.create_one();
        for p in patterns {
            assert!(container.add(&mut trie, p), "insert of {:?} failed", p);
        }
        (container, trie)
    }

    #[test]
    fn empty_trie_matches_nothing() {
        let mut container = TrieContainer::new();
        let trie = container.create_one();
        assert_eq!(container.matches(&trie, b"anything", 0), -1);
    }

    #[test]
    fn empty_pattern_is_a_noop() {
        let mut container = TrieContainer::new();
        let mut trie = container.create_one();
        assert!(!container.add(&mut trie, ""));
        assert_eq!(trie.len(), 0);
    }

    #[test]
    fn single_pattern_roundtrip() {
        let (container, trie) = trie_from(&["/banner.js"]);
        assert_eq!(container.matches(&trie, b"/banner.js", 0), 10);
        assert_eq!(container.matches(&trie, b"/banner.js?x=1", 0), 10);
        assert_eq!(container.matches(&trie, b"/banner.gif", 0), -1);
        assert_eq!(container.matches(&trie, b"x/banner.js", 1), 11);
        assert_eq!(container.matches(&trie, b"x/banner.js", 0), -1);
    }

    #[test]
    fn duplicate_insert_returns_false() {
        let mut container = TrieContainer::new();
        let mut trie = container.create_one();
        assert!(container.add(&mut trie, "/ads/"));
        assert!(!container.add(&mut trie, "/ads/"));
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn prefix_insert_after_longer_pattern() {
        // "ab" after "abc": boundary cell must be created.
        let (container, trie) = trie_from(&["abc", "ab"]);
        assert_eq!(container.matches(&trie, b"abq", 0), 2);
        assert_eq!(container.matches(&trie, b"abcq", 0), 3);
    }

    #[test]
    fn longest_match_wins() {
        let (container, trie) = trie_from(&["ab", "abc"]);
        // both patterns match "abcd"; the longer one must win
        assert_eq!(container.matches(&trie, b"abcd", 0), 3);
        assert_eq!(container.matches(&trie, b"abd", 0), 2);
    }

    #[test]
    fn split_and_branch_cases() {
        let patterns = ["-images/ad-", "/google_ad.", "/images_ad.", "_images/ad."];
        let (container, trie) = trie_from(&patterns);
        assert_eq!(trie.len(), 4);
        for p in &patterns {
            let end = container.matches(&trie, p.as_bytes(), 0);
            assert_eq!(end, p.len() as i32, "pattern {:?}", p);
        }
        assert_eq!(container.matches(&trie, b"/images/ad-", 0), -1);
        assert_eq!(container.matches(&trie, b"/google_ad.js", 0), 11);
    }

    #[test]
    fn shared_prefix_siblings() {
        let (container, trie) = trie_from(&["/adframe/", "/adframes.", "/adfoo"]);
        assert_eq!(container.matches(&trie, b"/adframe/x", 0), 9);
        assert_eq!(container.matches(&trie, b"/adframes.x", 0), 10);
        assert_eq!(container.matches(&trie, b"/adfoo", 0), 6);
        assert_eq!(container.matches(&trie, b"/adbar", 0), -1);
    }

    #[test]
    fn patterns_enumeration() {
        let inserted = ["/adframe/", "/adframes.", "/adfoo", "/adf"];
        let (container, trie) = trie_from(&inserted);
        let mut stored = container.patterns(&trie);
        stored.sort();
        let mut expected: Vec<String> = inserted.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(stored, expected);
    }

    #[test]
    fn multiple_tries_share_one_container() {
        let mut container = TrieContainer::new();
        let mut a = container.create_one();
        let mut b = container.create_one();
        container.add(&mut a, "/ads/");
        container.add(&mut b, "/track/");
        assert_eq!(container.matches(&a, b"/ads/", 0), 5);
        assert_eq!(container.matches(&a, b"/track/", 0), -1);
        assert_eq!(container.matches(&b, b"/track/", 0), 7);
        assert_eq!(container.matches(&b, b"/ads/", 0), -1);
    }

    #[test]
    fn long_pattern_spans_segments() {
        let long: String = "x".repeat(300);
        let (container, trie) = trie_from(&[long.as_str()]);
        let hay: String = "x".repeat(400);
        assert_eq!(container.matches(&trie, hay.as_bytes(), 0), 300);
        assert_eq!(container.matches(&trie, &hay.as_bytes()[..299], 0), -1);
    }

    #[test]
    fn serialize_unserialize_identical_answers() {
        let patterns = ["/adframe/", "/adframes.", "/adfoo", "banner-", "banner.gif"];
        let (container, trie) = trie_from(&patterns);
        let blob = container.serialize().unwrap();
        let restored = TrieContainer::unserialize(&blob).unwrap();
        let haystacks: [&[u8]; 4] = [b"/adframe/x", b"banner.gif", b"banner-x", b"none"];
        for hay in haystacks {
            assert_eq!(
                container.matches(&trie, hay, 0),
                restored.matches(&trie, hay, 0)
            );
        }
    }
}
