//! Immutable compressed signature trie
//!
//! Maps each member signature of a build to its dense index with one array
//! access per traversed character and no allocation. The trie is packed
//! into a single `u16` code-unit array; each node is laid out as:
//!
//! ```text
//! branch_count | pivots (sorted) | result cells | jump offsets (count-1)
//! ```
//!
//! A result cell is a *leaf* (bit 15 set, low bits the signature index), a
//! *bud* (bit 14 set; a leaf when the query ends on this character, else a
//! skip of one), or a positive *key delta* telling the cursor how many
//! characters to consume before entering the child. Children follow the
//! node in branch order; child 0 starts immediately after the jump table,
//! later children at their recorded offsets. The jump table is omitted when
//! every branch is a leaf.
//!
//! Each trie indexes at most [`MAX_ROWS_PER_TRIE`] signatures; larger
//! inputs chain an overflow trie per chunk, selected by the lexicographic
//! pivot key that separates the chunks, with indices biased by the chunk
//! base. A 16-bit jump offset can overflow on adversarial inputs; the
//! builder detects this and retries with a halved row cap, which the
//! chaining absorbs.
//!
//! Inputs that were not part of the build return an unspecified index but
//! never abort.

const LEAF: u16 = 0x8000;
const BUD: u16 = 0x4000;
const IDX_MASK: u16 = 0x3FFF;

/// Per-trie row cap.
pub const MAX_ROWS_PER_TRIE: usize = 1 << 14;

/// Signature-to-index function built over an ordered signature list.
#[derive(Debug, Clone)]
pub enum SignatureIndexer {
    /// Single-signature builds need no trie
    Constant0,
    /// One packed trie per chunk of at most the row cap
    Chunked(Vec<Chunk>),
}

/// One chained trie covering `[base, base + rows)` of the input.
#[derive(Debug, Clone)]
pub struct Chunk {
    base: usize,
    /// First signature of this chunk, the chain pivot (unused for chunk 0)
    pivot: Vec<u16>,
    /// Packed trie; `None` for a single-row chunk
    data: Option<Box<[u16]>>,
}

struct JumpOverflow;

impl SignatureIndexer {
    /// Build an indexer over distinct, non-empty, lexicographically sorted
    /// signatures (ordering by UTF-16 code units).
    pub fn build<S: AsRef<str>>(signatures: &[S]) -> SignatureIndexer {
        Self::build_with_cap(signatures, MAX_ROWS_PER_TRIE)
    }

    pub(crate) fn build_with_cap<S: AsRef<str>>(
        signatures: &[S],
        cap: usize,
    ) -> SignatureIndexer {
        if signatures.len() <= 1 {
            return SignatureIndexer::Constant0;
        }
        let keys: Vec<Vec<u16>> = signatures
            .iter()
            .map(|s| s.as_ref().encode_utf16().collect())
            .collect();
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]), "input not sorted");

        let mut cap = cap.min(MAX_ROWS_PER_TRIE);
        loop {
            match Self::build_chunks(&keys, cap) {
                Ok(chunks) => return SignatureIndexer::Chunked(chunks),
                Err(JumpOverflow) if cap > 2 => cap /= 2,
                Err(JumpOverflow) => {
                    // Cap 2 tries are a handful of units; unreachable in
                    // practice, but keep the contract of never aborting.
                    return SignatureIndexer::Constant0;
                }
            }
        }
    }

    fn build_chunks(keys: &[Vec<u16>], cap: usize) -> Result<Vec<Chunk>, JumpOverflow> {
        let mut chunks = Vec::with_capacity(keys.len().div_ceil(cap));
        let mut base = 0;
        while base < keys.len() {
            let end = (base + cap).min(keys.len());
            let rows: Vec<(usize, &[u16])> = keys[base..end]
                .iter()
                .enumerate()
                .map(|(i, k)| (i, k.as_slice()))
                .collect();
            let data = if rows.len() == 1 {
                None
            } else {
                let mut out = Vec::new();
                build_node(&mut out, &rows, 0)?;
                Some(out.into_boxed_slice())
            };
            chunks.push(Chunk {
                base,
                pivot: keys[base].clone(),
                data,
            });
            base = end;
        }
        Ok(chunks)
    }

    /// Index of `signature` in the build input; unspecified for other
    /// inputs, but never panics and never allocates.
    pub fn apply(&self, signature: &str) -> usize {
        match self {
            SignatureIndexer::Constant0 => 0,
            SignatureIndexer::Chunked(chunks) => {
                let mut chosen = 0;
                for (i, chunk) in chunks.iter().enumerate().skip(1) {
                    if key_at_least(signature, &chunk.pivot) {
                        chosen = i;
                    } else {
                        break;
                    }
                }
                let chunk = &chunks[chosen];
                let local = match &chunk.data {
                    None => 0,
                    Some(data) => lookup(data, signature),
                };
                chunk.base + local
            }
        }
    }
}

/// `signature >= pivot` by code units, without allocating.
fn key_at_least(signature: &str, pivot: &[u16]) -> bool {
    let mut units = signature.encode_utf16();
    for &p in pivot {
        match units.next() {
            None => return false,             // proper prefix sorts first
            Some(u) if u < p => return false,
            Some(u) if u > p => return true,
            Some(_) => {}
        }
    }
    true
}

fn lookup(data: &[u16], signature: &str) -> usize {
    let total = signature.encode_utf16().count();
    let mut units = signature.encode_utf16();
    let Some(mut cur) = units.next() else {
        return 0;
    };
    let mut remaining = total - 1;
    let mut node = 0usize;
    loop {
        let bc = data[node] as usize;
        let pivots = &data[node + 1..node + 1 + bc];
        let Ok(branch) = pivots.binary_search(&cur) else {
            return 0;
        };
        let cell = data[node + 1 + bc + branch];
        if cell & LEAF != 0 {
            return (cell & IDX_MASK) as usize;
        }
        // Not a leaf, so this node carries a jump table.
        let jumps = node + 1 + 2 * bc;
        let child_base = jumps + bc - 1;
        let child = if branch == 0 {
            child_base
        } else {
            child_base + data[jumps + branch - 1] as usize
        };
        let delta = if cell & BUD != 0 {
            if remaining == 0 {
                return (cell & IDX_MASK) as usize;
            }
            1
        } else {
            cell as usize
        };
        for _ in 0..delta {
            match units.next() {
                Some(u) => {
                    cur = u;
                    remaining -= 1;
                }
                None => return 0,
            }
        }
        node = child;
    }
}

enum Cell {
    Leaf(u16),
    Bud(u16),
    Delta(u16),
}

/// Append one node for `rows` (sorted, distinct, all longer than `column`,
/// sharing `key[..column]`), then its children.
fn build_node(
    out: &mut Vec<u16>,
    rows: &[(usize, &[u16])],
    column: usize,
) -> Result<(), JumpOverflow> {
    // Group rows into branches by the unit at `column`; sorted input keeps
    // each branch contiguous.
    let mut branches: Vec<(u16, std::ops::Range<usize>)> = Vec::new();
    let mut start = 0;
    while start < rows.len() {
        let pivot = rows[start].1[column];
        let mut end = start + 1;
        while end < rows.len() && rows[end].1[column] == pivot {
            end += 1;
        }
        branches.push((pivot, start..end));
        start = end;
    }
    let bc = branches.len();

    // Plan each branch before emitting the header.
    struct Plan {
        cell: Cell,
        child: Option<(std::ops::Range<usize>, usize)>,
    }
    let mut plans = Vec::with_capacity(bc);
    for (_, range) in &branches {
        let group = &rows[range.clone()];
        if group.len() == 1 {
            plans.push(Plan {
                cell: Cell::Leaf(group[0].0 as u16),
                child: None,
            });
            continue;
        }
        let first = group[0].1;
        let last = group[group.len() - 1].1;
        let limit = first.len().min(last.len()) - column;
        let mut m = 0;
        while m < limit && first[column + m] == last[column + m] {
            m += 1;
        }
        let ends_in_run = first.len() == column + m;
        let plan = if ends_in_run && m == 1 {
            // The shortest row terminates on the pivot character.
            Plan {
                cell: Cell::Bud(group[0].0 as u16),
                child: Some((range.start + 1..range.end, column + 1)),
            }
        } else {
            // Skip the shared run (stopping one short when a row ends on
            // its last character, so the bud lands on a node), capped to
            // what a cell can carry.
            let skip = if ends_in_run { m - 1 } else { m };
            let skip = skip.min(IDX_MASK as usize) as u16;
            Plan {
                cell: Cell::Delta(skip),
                child: Some((range.clone(), column + skip as usize)),
            }
        };
        plans.push(plan);
    }

    let all_leaves = plans.iter().all(|p| p.child.is_none());
    out.push(bc as u16);
    for (pivot, _) in &branches {
        out.push(*pivot);
    }
    for plan in &plans {
        out.push(match plan.cell {
            Cell::Leaf(idx) => LEAF | idx,
            Cell::Bud(idx) => BUD | idx,
            Cell::Delta(d) => d,
        });
    }
    let jumps_at = out.len();
    if !all_leaves {
        for _ in 1..bc {
            out.push(0);
        }
    }
    let child_base = out.len();

    for (i, plan) in plans.iter().enumerate() {
        let Some((range, child_column)) = &plan.child else {
            continue;
        };
        if i > 0 {
            let offset = out.len() - child_base;
            if offset > u16::MAX as usize {
                return Err(JumpOverflow);
            }
            out[jumps_at + i - 1] = offset as u16;
        }
        build_node(out, &rows[range.clone()], *child_column)?;
    }
    Ok(())
}
