//! # Chase
//!
//! Pointer-chase graph for dependent-load latency. The region is cut into
//! `cacheline_count` nodes of `cacheline_bytes` each; the nodes at every
//! `stride`-th position are linked into a single cycle, sequentially or in a
//! shuffled order. Nodes in between are never visited and only space the
//! participating ones apart.
//!
//! Links are word indices into the region (node index times words per node),
//! so one hop is a single `base[cursor]` load with no further arithmetic on the
//! dependent path.
use crate::accessor::{MemoryAccessor, NativeAccessor, flush_range};
use crate::alloc::{self, HugePages, Region};
use crate::error::{Error, Result};
use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Word offsets of the node fields.
const NEXT: usize = 0;
const ORDER: usize = 1;
const INDEX: usize = 2;
/// Words in a node header; the rest of the line is padding.
const HEADER_WORDS: usize = 3;
const WORD: usize = std::mem::size_of::<usize>();

/// Shuffle rounds applied when randomizing.
pub const SHUFFLE_ROUNDS: usize = 10;
/// Hops per unrolled iteration of the chase loop.
pub const UNROLL: usize = 10;

/// `next` of a node that is not part of the cycle.
const UNLINKED: usize = usize::MAX;

/// Construction parameters of a chase graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChaseParams {
    pub cacheline_bytes: usize,
    pub cacheline_count: usize,
    pub stride: usize,
    pub randomize: bool,
    pub clear_cache: bool,
    pub hugepages: HugePages,
}

impl ChaseParams {
    /// Check the stride and node layout preconditions.
    pub fn validate(&self) -> Result<()> {
        if self.stride == 0 || self.stride > self.cacheline_count {
            return Err(Error::InvalidStride {
                stride: self.stride,
                count: self.cacheline_count,
            });
        }
        if self.stride == self.cacheline_count && self.randomize {
            return Err(Error::RandomizeSelfLoop {
                count: self.cacheline_count,
            });
        }
        if self.cacheline_bytes % WORD != 0 {
            return Err(Error::CachelineAlignment {
                cacheline_bytes: self.cacheline_bytes,
                pointer_bytes: WORD,
            });
        }
        if self.cacheline_bytes < HEADER_WORDS * WORD {
            return Err(Error::NodeSize {
                node_bytes: HEADER_WORDS * WORD,
                cacheline_bytes: self.cacheline_bytes,
            });
        }
        Ok(())
    }

    /// Number of nodes in the cycle: one per stride-aligned position.
    pub fn cycle_len(&self) -> usize {
        self.cacheline_count.div_ceil(self.stride)
    }
}

/// A built, read-only chase graph.
#[derive(Debug)]
pub struct ChaseGraph {
    region: Region,
    params: ChaseParams,
    words_per_node: usize,
}

impl ChaseGraph {
    /// Allocate and link a graph. `seed` drives the shuffle when randomizing.
    pub fn build(params: ChaseParams, seed: u64) -> Result<Self> {
        params.validate()?;

        // validate() guarantees a whole number of words per node
        let words_per_node = params.cacheline_bytes / WORD;

        let bytes = params
            .cacheline_bytes
            .checked_mul(params.cacheline_count)
            .ok_or_else(|| Error::InvalidConfig("chase region size overflows".into()))?;
        let mut region = alloc::allocate(bytes, params.hugepages, alloc::page_size())?;

        link(region.words_mut(), &params, words_per_node, seed);

        if params.clear_cache {
            // SAFETY: the whole region is mapped.
            unsafe { flush_range(region.as_ptr(), region.len(), params.cacheline_bytes) };
        }

        debug!(
            "built chase graph: {} nodes of {} bytes, stride {}, cycle of {}",
            params.cacheline_count,
            params.cacheline_bytes,
            params.stride,
            params.cycle_len()
        );

        Ok(ChaseGraph {
            region,
            params,
            words_per_node,
        })
    }

    pub fn params(&self) -> &ChaseParams {
        &self.params
    }

    pub fn cycle_len(&self) -> usize {
        self.params.cycle_len()
    }

    /// Cursor of the first node; node 0 always sits on the cycle.
    pub fn head(&self) -> usize {
        0
    }

    /// Node index a cursor points at.
    pub fn node_of(&self, cursor: usize) -> usize {
        cursor / self.words_per_node
    }

    /// Node linked after `node`, `None` for filler nodes.
    pub fn successor(&self, node: usize) -> Option<usize> {
        let next = self.region.words()[node * self.words_per_node + NEXT];
        (next != UNLINKED).then(|| next / self.words_per_node)
    }

    /// Diagnostic index stored in `node`.
    pub fn index_of(&self, node: usize) -> usize {
        self.region.words()[node * self.words_per_node + INDEX]
    }

    /// Nodes of the cycle in visiting order, starting from node 0.
    pub fn cycle(&self) -> Vec<usize> {
        let mut nodes = vec![0];
        let mut node = 0;
        while let Some(next) = self.successor(node) {
            if next == 0 || nodes.len() > self.params.cacheline_count {
                break;
            }
            nodes.push(next);
            node = next;
        }
        nodes
    }

    /// Follow `steps` links from `cursor` and return the cursor reached.
    pub fn chase(&self, cursor: usize, steps: usize) -> usize {
        chase_with::<NativeAccessor>(self.region.as_ptr() as *const usize, cursor, steps)
    }
}

/// Link the cycle over `words`, viewed as nodes of `words_per_node` words.
fn link(words: &mut [usize], params: &ChaseParams, words_per_node: usize, seed: u64) {
    let count = params.cacheline_count;
    let stride = params.stride;

    // order starts as the identity permutation
    for node in 0..count {
        let base = node * words_per_node;
        words[base + NEXT] = UNLINKED;
        words[base + ORDER] = node;
        words[base + INDEX] = node;
    }

    let slots = params.cycle_len();
    if params.randomize {
        let mut rng = SmallRng::seed_from_u64(seed);
        for _ in 0..SHUFFLE_ROUNDS {
            for _ in 0..slots {
                let (a, b) = loop {
                    let a = rng.random_range(0..slots) * stride;
                    let b = rng.random_range(0..slots) * stride;
                    if a != b {
                        break (a, b);
                    }
                };
                words.swap(a * words_per_node + ORDER, b * words_per_node + ORDER);
            }
        }
    }

    let order = |words: &[usize], pos: usize| words[pos * words_per_node + ORDER];
    let last = (slots - 1) * stride;
    for pos in (0..last).step_by(stride) {
        let from = order(words, pos);
        let to = order(words, pos + stride);
        words[from * words_per_node + NEXT] = to * words_per_node;
    }
    let from = order(words, last);
    let to = order(words, 0);
    words[from * words_per_node + NEXT] = to * words_per_node;
}

/// Dependent-load loop. Kept out of line so the timed region is a single call.
#[inline(never)]
fn chase_with<A: MemoryAccessor>(base: *const usize, mut cursor: usize, steps: usize) -> usize {
    for _ in 0..steps / UNROLL {
        // SAFETY (all hops): every cursor on the cycle is a node start inside the region.
        unsafe {
            cursor = A::read_line(base.add(cursor));
            cursor = A::read_line(base.add(cursor));
            cursor = A::read_line(base.add(cursor));
            cursor = A::read_line(base.add(cursor));
            cursor = A::read_line(base.add(cursor));

            cursor = A::read_line(base.add(cursor));
            cursor = A::read_line(base.add(cursor));
            cursor = A::read_line(base.add(cursor));
            cursor = A::read_line(base.add(cursor));
            cursor = A::read_line(base.add(cursor));
        }
    }
    for _ in 0..steps % UNROLL {
        cursor = unsafe { A::read_line(base.add(cursor)) };
    }
    cursor
}
