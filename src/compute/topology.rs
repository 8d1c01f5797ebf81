//! Digital topology: simple-point lookup tables and component counting.
//!
//! A label flip at a voxel preserves topology when the voxel is a *simple
//! point* of the object it leaves or joins. Simplicity depends only on the
//! 3x3(x3) neighborhood, so it is tabulated once per connectivity rule and
//! indexed by a neighborhood code: bit `k` is set when the `k`-th neighbor
//! (raster order z, y, x with the center skipped) belongs to the object.
//!
//! Classification uses the topological numbers of Bertrand and Malandain:
//! a point is simple iff `T_fg(x, X) == 1` and `T_bg(x, !X) == 1`.

use std::sync::{Arc, LazyLock, OnceLock};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{GridDims, LabelMode, LevelSetField};

/// Foreground/background adjacency pair used for topology preservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectivityRule {
    /// 2D, 4-connected objects with 8-connected background.
    FourEight,
    /// 2D, 8-connected objects with 4-connected background.
    EightFour,
    /// 3D, 6-connected objects with 18-connected background.
    SixEighteen,
    /// 3D, 18-connected objects with 6-connected background.
    EighteenSix,
    /// 3D, 6-connected objects with 26-connected background.
    SixTwentySix,
    /// 3D, 26-connected objects with 6-connected background.
    TwentySixSix,
}

impl ConnectivityRule {
    pub const ALL: [ConnectivityRule; 6] = [
        ConnectivityRule::FourEight,
        ConnectivityRule::EightFour,
        ConnectivityRule::SixEighteen,
        ConnectivityRule::EighteenSix,
        ConnectivityRule::SixTwentySix,
        ConnectivityRule::TwentySixSix,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    /// Rules for 3D grids.
    pub fn is_3d(self) -> bool {
        !matches!(self, ConnectivityRule::FourEight | ConnectivityRule::EightFour)
    }

    /// Number of bits in a neighborhood code (8, 18 or 26).
    pub fn code_bits(self) -> u32 {
        match self {
            ConnectivityRule::FourEight | ConnectivityRule::EightFour => 8,
            ConnectivityRule::SixEighteen | ConnectivityRule::EighteenSix => 18,
            ConnectivityRule::SixTwentySix | ConnectivityRule::TwentySixSix => 26,
        }
    }

    /// Same rule with foreground and background swapped.
    pub fn dual(self) -> Self {
        match self {
            ConnectivityRule::FourEight => ConnectivityRule::EightFour,
            ConnectivityRule::EightFour => ConnectivityRule::FourEight,
            ConnectivityRule::SixEighteen => ConnectivityRule::EighteenSix,
            ConnectivityRule::EighteenSix => ConnectivityRule::SixEighteen,
            ConnectivityRule::SixTwentySix => ConnectivityRule::TwentySixSix,
            ConnectivityRule::TwentySixSix => ConnectivityRule::SixTwentySix,
        }
    }

    /// Adjacency of object voxels.
    pub fn foreground(self) -> Adjacency {
        match self {
            ConnectivityRule::FourEight => Adjacency::Four,
            ConnectivityRule::EightFour => Adjacency::Eight,
            ConnectivityRule::SixEighteen | ConnectivityRule::SixTwentySix => Adjacency::Six,
            ConnectivityRule::EighteenSix => Adjacency::Eighteen,
            ConnectivityRule::TwentySixSix => Adjacency::TwentySix,
        }
    }

    /// Adjacency of background voxels.
    pub fn background(self) -> Adjacency {
        self.dual().foreground()
    }

    /// Neighbor offsets `(dx, dy, dz)` in code bit order.
    pub fn offsets(self) -> &'static [(i32, i32, i32)] {
        &NEIGHBORHOODS[self.index()].offsets
    }
}

/// Point adjacency on the square/cubic lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjacency {
    Four,
    Eight,
    Six,
    Eighteen,
    TwentySix,
}

impl Adjacency {
    /// Whether two points at the given offset are adjacent.
    pub fn links(self, dx: i32, dy: i32, dz: i32) -> bool {
        let manhattan = dx.abs() + dy.abs() + dz.abs();
        let chebyshev = dx.abs().max(dy.abs()).max(dz.abs());
        if manhattan == 0 || chebyshev > 1 {
            return false;
        }
        match self {
            Adjacency::Four => dz == 0 && manhattan == 1,
            Adjacency::Eight => dz == 0,
            Adjacency::Six => manhattan == 1,
            Adjacency::Eighteen => manhattan <= 2,
            Adjacency::TwentySix => true,
        }
    }

    /// Offsets of every adjacent point.
    pub fn neighbor_offsets(self) -> Vec<(i32, i32, i32)> {
        let mut offsets = Vec::new();
        for dz in -1..=1 {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    if self.links(dx, dy, dz) {
                        offsets.push((dx, dy, dz));
                    }
                }
            }
        }
        offsets
    }

    /// Face adjacencies only count components that touch a face neighbor.
    fn needs_face_contact(self) -> bool {
        matches!(self, Adjacency::Four | Adjacency::Six)
    }
}

/// Bitmask form of one adjacency restricted to a neighborhood.
struct CodeGraph {
    /// `links[k]` = code bits adjacent to bit `k`.
    links: Vec<u32>,
    /// Bits that take part in the topological number.
    domain: u32,
    /// A component is counted only if it intersects these bits.
    seeds: u32,
}

impl CodeGraph {
    fn build(adjacency: Adjacency, offsets: &[(i32, i32, i32)]) -> Self {
        let mut domain = 0u32;
        let mut seeds = 0u32;
        for (k, &(dx, dy, dz)) in offsets.iter().enumerate() {
            let manhattan = dx.abs() + dy.abs() + dz.abs();
            // 6-adjacency works on the 18-neighborhood.
            if adjacency != Adjacency::Six || manhattan <= 2 {
                domain |= 1 << k;
            }
            if !adjacency.needs_face_contact() || manhattan == 1 {
                seeds |= 1 << k;
            }
        }
        seeds &= domain;

        let links = offsets
            .iter()
            .map(|&(ax, ay, az)| {
                offsets
                    .iter()
                    .enumerate()
                    .filter(|&(_, &(bx, by, bz))| adjacency.links(bx - ax, by - ay, bz - az))
                    .fold(0u32, |mask, (j, _)| mask | (1 << j))
                    & domain
            })
            .collect();

        Self {
            links,
            domain,
            seeds,
        }
    }

    /// Number of components of `set` inside the domain that meet the seeds.
    fn topological_number(&self, set: u32) -> u32 {
        let mut remaining = set & self.domain;
        let mut count = 0;
        while remaining != 0 {
            let start = remaining & remaining.wrapping_neg();
            let mut component = start;
            let mut frontier = start;
            while frontier != 0 {
                let mut next = 0u32;
                let mut bits = frontier;
                while bits != 0 {
                    let k = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    next |= self.links[k];
                }
                frontier = next & remaining & !component;
                component |= frontier;
            }
            remaining &= !component;
            if component & self.seeds != 0 {
                count += 1;
            }
        }
        count
    }
}

struct Neighborhood {
    offsets: Vec<(i32, i32, i32)>,
    foreground: CodeGraph,
    background: CodeGraph,
    full: u32,
}

impl Neighborhood {
    fn build(rule: ConnectivityRule) -> Self {
        let span = if rule.is_3d() { -1i32..=1 } else { 0..=0 };
        let mut offsets = Vec::with_capacity(rule.code_bits() as usize);
        for dz in span {
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    let manhattan = dx.abs() + dy.abs() + dz.abs();
                    if manhattan == 0 || (rule.code_bits() == 18 && manhattan > 2) {
                        continue;
                    }
                    offsets.push((dx, dy, dz));
                }
            }
        }
        let foreground = CodeGraph::build(rule.foreground(), &offsets);
        let background = CodeGraph::build(rule.background(), &offsets);
        let full = ((1u64 << offsets.len()) - 1) as u32;
        Self {
            offsets,
            foreground,
            background,
            full,
        }
    }
}

static NEIGHBORHOODS: LazyLock<[Neighborhood; 6]> =
    LazyLock::new(|| ConnectivityRule::ALL.map(Neighborhood::build));

static SHARED: [OnceLock<Arc<TopologyLut>>; 6] = [const { OnceLock::new() }; 6];

/// Decide whether the center point is simple for the object described by `code`.
pub fn classify(rule: ConnectivityRule, code: u32) -> bool {
    let hood = &NEIGHBORHOODS[rule.index()];
    let inside = code & hood.full;
    let outside = !code & hood.full;
    hood.foreground.topological_number(inside) == 1
        && hood.background.topological_number(outside) == 1
}

/// Errors raised while loading a packed lookup table.
#[derive(Debug, thiserror::Error)]
pub enum LutError {
    #[error("Packed table for {rule:?} needs {expected} bytes, got {actual}")]
    Length {
        rule: ConnectivityRule,
        expected: usize,
        actual: usize,
    },
}

/// Packed simple-point bitset for one connectivity rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyLut {
    rule: ConnectivityRule,
    words: Vec<u64>,
}

impl TopologyLut {
    /// Enumerate every neighborhood code.
    pub fn generate(rule: ConnectivityRule) -> Self {
        let codes = 1usize << rule.code_bits();
        let words = (0..codes.div_ceil(64))
            .into_par_iter()
            .map(|w| {
                (0..64)
                    .filter(|&j| {
                        let code = w * 64 + j;
                        code < codes && classify(rule, code as u32)
                    })
                    .fold(0u64, |word, j| word | (1 << j))
            })
            .collect();
        log::debug!("Generated topology table for {:?} ({} codes)", rule, codes);
        Self { rule, words }
    }

    /// Process-wide table for `rule`, generated on first use.
    pub fn shared(rule: ConnectivityRule) -> Arc<Self> {
        SHARED[rule.index()]
            .get_or_init(|| Arc::new(Self::generate(rule)))
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn is_cached(rule: ConnectivityRule) -> bool {
        SHARED[rule.index()].get().is_some()
    }

    /// Load a table from its packed little-endian form.
    pub fn from_packed_bytes(rule: ConnectivityRule, bytes: &[u8]) -> Result<Self, LutError> {
        let expected = Self::packed_len(rule);
        if bytes.len() != expected {
            return Err(LutError::Length {
                rule,
                expected,
                actual: bytes.len(),
            });
        }
        let words = bytes
            .chunks(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf[..chunk.len()].copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect();
        Ok(Self { rule, words })
    }

    /// Byte i, bit j holds code `8 * i + j`.
    pub fn to_packed_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        bytes.truncate(Self::packed_len(self.rule));
        bytes
    }

    fn packed_len(rule: ConnectivityRule) -> usize {
        (1usize << rule.code_bits()) / 8
    }

    pub fn rule(&self) -> ConnectivityRule {
        self.rule
    }

    #[inline]
    pub fn is_simple(&self, code: u32) -> bool {
        let code = code as usize;
        self.words
            .get(code / 64)
            .is_some_and(|word| word & (1 << (code % 64)) != 0)
    }
}

/// Neighborhood code of voxel `i`. Out-of-grid neighbors are non-members.
pub fn neighborhood_code(
    dims: GridDims,
    labels: &[u32],
    i: usize,
    rule: ConnectivityRule,
    member: impl Fn(u32) -> bool,
) -> u32 {
    rule.offsets()
        .iter()
        .enumerate()
        .filter(|&(_, &(dx, dy, dz))| {
            dims.offset(i, dx, dy, dz)
                .is_some_and(|n| member(labels[n]))
        })
        .fold(0u32, |code, (k, _)| code | (1 << k))
}

/// Connected components of `object` under the rule's foreground adjacency.
pub fn count_components(
    field: &LevelSetField,
    object: u32,
    mode: LabelMode,
    rule: ConnectivityRule,
) -> usize {
    let dims = field.dims;
    let offsets = rule.foreground().neighbor_offsets();
    let mut seen = vec![false; dims.len()];
    let mut stack = Vec::new();
    let mut components = 0;

    for start in 0..dims.len() {
        if seen[start] || !mode.contains(field.labels[start], object) {
            continue;
        }
        components += 1;
        seen[start] = true;
        stack.push(start);
        while let Some(i) = stack.pop() {
            for &(dx, dy, dz) in &offsets {
                if let Some(n) = dims.offset(i, dx, dy, dz)
                    && !seen[n]
                    && mode.contains(field.labels[n], object)
                {
                    seen[n] = true;
                    stack.push(n);
                }
            }
        }
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // 2D code bits: NW N NE W E SW S SE
    const N: u32 = 1 << 1;
    const NE: u32 = 1 << 2;
    const W: u32 = 1 << 3;
    const E: u32 = 1 << 4;
    const S: u32 = 1 << 6;

    #[test]
    fn test_code_bits_match_offsets() {
        for rule in ConnectivityRule::ALL {
            assert_eq!(rule.offsets().len() as u32, rule.code_bits(), "{:?}", rule);
            assert_eq!(rule.dual().dual(), rule);
        }
    }

    #[test]
    fn test_isolated_and_interior_points_are_not_simple() {
        for rule in ConnectivityRule::ALL {
            let full = ((1u64 << rule.code_bits()) - 1) as u32;
            assert!(!classify(rule, 0), "isolated point simple under {:?}", rule);
            assert!(!classify(rule, full), "interior point simple under {:?}", rule);
        }
    }

    #[test]
    fn test_end_point_is_simple() {
        assert!(classify(ConnectivityRule::EightFour, E));
        assert!(classify(ConnectivityRule::FourEight, E));
        // +x face neighbor in both 3D neighborhoods.
        for rule in [
            ConnectivityRule::SixEighteen,
            ConnectivityRule::EighteenSix,
            ConnectivityRule::SixTwentySix,
            ConnectivityRule::TwentySixSix,
        ] {
            let k = rule.offsets().iter().position(|&o| o == (1, 0, 0)).unwrap();
            assert!(classify(rule, 1 << k), "{:?}", rule);
        }
    }

    #[test]
    fn test_bridge_point_is_not_simple() {
        assert!(!classify(ConnectivityRule::EightFour, W | E));
        assert!(!classify(ConnectivityRule::FourEight, W | E));
        assert!(!classify(ConnectivityRule::EightFour, N | S));
    }

    #[test]
    fn test_diagonal_contact_depends_on_rule() {
        // Only an 8-connected object sees the diagonal neighbor.
        assert!(classify(ConnectivityRule::EightFour, NE));
        assert!(!classify(ConnectivityRule::FourEight, NE));
    }

    #[test]
    fn test_removing_cross_center_creates_cavity() {
        let rule = ConnectivityRule::TwentySixSix;
        let cross = rule
            .offsets()
            .iter()
            .enumerate()
            .filter(|&(_, &(dx, dy, dz))| dx.abs() + dy.abs() + dz.abs() == 1)
            .fold(0u32, |code, (k, _)| code | (1 << k));
        assert!(!classify(rule, cross));
    }

    #[test]
    fn test_2d_duality_exhaustive() {
        let lut84 = TopologyLut::generate(ConnectivityRule::EightFour);
        let lut48 = TopologyLut::generate(ConnectivityRule::FourEight);
        for code in 0..256u32 {
            assert_eq!(
                lut84.is_simple(code),
                lut48.is_simple(!code & 0xFF),
                "code {:08b}",
                code
            );
        }
    }

    #[test]
    fn test_packed_roundtrip() {
        let lut = TopologyLut::generate(ConnectivityRule::EightFour);
        let bytes = lut.to_packed_bytes();
        assert_eq!(bytes.len(), 32);
        let loaded = TopologyLut::from_packed_bytes(ConnectivityRule::EightFour, &bytes).unwrap();
        assert_eq!(loaded, lut);
        // Byte layout: bit j of byte i is code 8i + j.
        assert_eq!(bytes[(E / 8) as usize] >> (E % 8) & 1 == 1, lut.is_simple(E));
    }

    #[test]
    fn test_packed_length_is_checked() {
        let result = TopologyLut::from_packed_bytes(ConnectivityRule::SixEighteen, &[0u8; 32]);
        assert!(matches!(
            result,
            Err(LutError::Length {
                expected: 32768,
                actual: 32,
                ..
            })
        ));
    }

    #[test]
    fn test_shared_table_is_reused() {
        let a = TopologyLut::shared(ConnectivityRule::FourEight);
        let b = TopologyLut::shared(ConnectivityRule::FourEight);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.rule(), ConnectivityRule::FourEight);
    }

    #[test]
    fn test_neighborhood_code_and_components() {
        let dims = GridDims::new_2d(8, 8);
        let mut labels = vec![0u32; dims.len()];
        // Two diagonal-touching squares.
        for (x, y) in [(1, 1), (2, 1), (1, 2), (2, 2), (3, 3), (4, 3), (3, 4), (4, 4)] {
            labels[dims.idx(x, y, 0)] = 1;
        }
        let code = neighborhood_code(
            dims,
            &labels,
            dims.idx(2, 2, 0),
            ConnectivityRule::EightFour,
            |l| l == 1,
        );
        // NW, N, W and SE are set.
        assert_eq!(code, 0b1000_1011);

        let field = LevelSetField::from_labels(dims, labels, 2).unwrap();
        let mode = LabelMode::Exclusive;
        assert_eq!(count_components(&field, 1, mode, ConnectivityRule::EightFour), 1);
        assert_eq!(count_components(&field, 1, mode, ConnectivityRule::FourEight), 2);
        assert_eq!(count_components(&field, 0, mode, ConnectivityRule::FourEight), 1);
    }

    #[test]
    fn test_edge_neighbors_are_outside() {
        let dims = GridDims::new_2d(4, 4);
        let labels = vec![1u32; dims.len()];
        let code = neighborhood_code(dims, &labels, 0, ConnectivityRule::FourEight, |l| l == 1);
        // Only E, S and SE exist at the corner.
        assert_eq!(code, (1 << 4) | (1 << 6) | (1 << 7));
    }

    proptest! {
        #[test]
        fn dual_3d_rules_agree_on_complement(code in 0u32..(1 << 26)) {
            let full26 = (1u32 << 26) - 1;
            prop_assert_eq!(
                classify(ConnectivityRule::SixTwentySix, code),
                classify(ConnectivityRule::TwentySixSix, !code & full26)
            );
            let code18 = code & ((1 << 18) - 1);
            prop_assert_eq!(
                classify(ConnectivityRule::SixEighteen, code18),
                classify(ConnectivityRule::EighteenSix, !code18 & ((1 << 18) - 1))
            );
        }
    }
}
