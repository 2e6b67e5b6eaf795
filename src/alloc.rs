//! Free-list allocator over the mapped heap.
//!
//! The heap is the region of a store file past [`HEAP_BASE`]. Every byte of
//! it belongs to exactly one block: a 16-byte [`BlockHeader`] followed by the
//! payload. Free blocks form a singly linked list threaded through their
//! payloads, sorted by address, with its head in the store header's
//! `alloc_root`. Allocation is first fit, rounded up to 16-byte alignment;
//! over-sized fits are split when the remainder is itself a valid block, and
//! freed neighbours coalesce immediately.

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, StoreError};
use crate::mapping::{round_up, Mapping, HEAP_BASE};
use crate::Ref;

pub(crate) const BLOCK_HDR: usize = 16;
/// Payloads and block sizes are multiples of this; it covers the widest
/// natural alignment of any attribute type (LONG_DOUBLE, 16 bytes).
pub(crate) const ALIGN: usize = 16;
/// Header plus the smallest payload; a free block needs room for its link.
pub(crate) const MIN_BLOCK: usize = 32;

const TAG_USED: u32 = 0x5345_4455; // "USED"
const TAG_FREE: u32 = 0x4545_5246; // "FREE"

#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct BlockHeader {
    /// Total block size, header included
    size: u64,
    tag: u32,
    _pad: u32,
}

fn read_block(map: &Mapping, off: u64) -> Result<BlockHeader> {
    let hdr: BlockHeader = map.read(off)?;
    if hdr.tag != TAG_USED && hdr.tag != TAG_FREE {
        return Err(StoreError::Corrupt("unrecognized heap block tag"));
    }
    let size = hdr.size as usize;
    if size < MIN_BLOCK || size % ALIGN != 0 || off as usize + size > map.len() {
        return Err(StoreError::Corrupt("implausible heap block size"));
    }
    Ok(hdr)
}

fn next_free(map: &Mapping, off: u64) -> Result<u64> {
    map.read(off + BLOCK_HDR as u64)
}

fn set_next_free(map: &mut Mapping, off: u64, next: u64) -> Result<()> {
    map.write(off + BLOCK_HDR as u64, &next)
}

fn link(map: &mut Mapping, prev: Option<u64>, target: u64) -> Result<()> {
    match prev {
        Some(p) => set_next_free(map, p, target),
        None => map.set_alloc_root(target),
    }
}

/// Format a fresh heap: one free block covering everything past the
/// reserved region.
pub(crate) fn init(map: &mut Mapping) -> Result<()> {
    let size = map.len() as u64 - HEAP_BASE;
    map.write(
        HEAP_BASE,
        &BlockHeader {
            size,
            tag: TAG_FREE,
            _pad: 0,
        },
    )?;
    set_next_free(map, HEAP_BASE, 0)?;
    map.set_alloc_root(HEAP_BASE)
}

/// Round a payload request up to the total block size it needs.
fn block_size_for(payload: usize) -> usize {
    BLOCK_HDR + round_up(payload.max(ALIGN), ALIGN)
}

/// Whether a block of `need` bytes placed at `off` would cross a page
/// boundary it doesn't have to.
fn crosses_page(off: u64, need: usize, page: usize) -> bool {
    need <= page && (off as usize & (page - 1)) + need > page
}

/// Allocate a block with a payload of at least `payload` bytes. A request of
/// zero bytes yields the minimum-sized block. Returns the payload offset.
pub(crate) fn alloc(map: &mut Mapping, payload: usize) -> Result<Ref> {
    let need = block_size_for(payload);
    let page = map.header()?.page_size as usize;

    // First pass prefers placements that keep sub-page blocks within one
    // page; the second pass takes any fit.
    for strict in [true, false] {
        let mut prev: Option<u64> = None;
        let mut cur = map.alloc_root()?;
        while cur != 0 {
            let hdr = read_block(map, cur)?;
            debug_assert_eq!(hdr.tag, TAG_FREE);
            let bsz = hdr.size as usize;
            let next = next_free(map, cur)?;
            if bsz >= need {
                if !crosses_page(cur, need, page) {
                    return take(map, prev, cur, bsz, next, need);
                }
                // Splitting at the page boundary keeps the block inside a
                // page; requires the head remainder to be a valid block.
                let head = page - (cur as usize & (page - 1));
                if head >= MIN_BLOCK && bsz >= head + need {
                    map.write(
                        cur,
                        &BlockHeader {
                            size: head as u64,
                            tag: TAG_FREE,
                            _pad: 0,
                        },
                    )?;
                    let tail = cur + head as u64;
                    set_next_free(map, cur, next)?;
                    return take(map, Some(cur), tail, bsz - head, next, need);
                }
                if !strict {
                    // Size mandates crossing
                    return take(map, prev, cur, bsz, next, need);
                }
            }
            prev = Some(cur);
            cur = next;
        }
    }
    Err(StoreError::NoMem { requested: payload })
}

/// Carve an allocation of `need` bytes out of the free region at `off`
/// (`bsz` bytes, list successor `next`, list predecessor `prev`). Splits off
/// a free remainder when one fits.
fn take(
    map: &mut Mapping,
    prev: Option<u64>,
    off: u64,
    bsz: usize,
    next: u64,
    need: usize,
) -> Result<Ref> {
    let taken = if bsz - need >= MIN_BLOCK {
        let rem = off + need as u64;
        map.write(
            rem,
            &BlockHeader {
                size: (bsz - need) as u64,
                tag: TAG_FREE,
                _pad: 0,
            },
        )?;
        set_next_free(map, rem, next)?;
        link(map, prev, rem)?;
        need
    } else {
        link(map, prev, next)?;
        bsz
    };
    map.write(
        off,
        &BlockHeader {
            size: taken as u64,
            tag: TAG_USED,
            _pad: 0,
        },
    )?;
    Ok(off + BLOCK_HDR as u64)
}

/// Validate `r` points at an allocated payload and return the payload size.
pub(crate) fn payload_size(map: &Mapping, r: Ref) -> Result<usize> {
    if r < HEAP_BASE + BLOCK_HDR as u64 || (r - BLOCK_HDR as u64) % ALIGN as u64 != 0 {
        return Err(StoreError::InvalidAccess { offset: r, len: 0 });
    }
    let hdr = read_block(map, r - BLOCK_HDR as u64)?;
    if hdr.tag != TAG_USED {
        return Err(StoreError::InvalidAccess { offset: r, len: 0 });
    }
    Ok(hdr.size as usize - BLOCK_HDR)
}

/// Free the block whose payload is at `r`, coalescing with free neighbours.
pub(crate) fn free(map: &mut Mapping, r: Ref) -> Result<()> {
    payload_size(map, r)?;
    let off = r - BLOCK_HDR as u64;
    let mut hdr = read_block(map, off)?;
    hdr.tag = TAG_FREE;

    // Locate the address-sorted insertion point
    let mut prev: Option<u64> = None;
    let mut cur = map.alloc_root()?;
    while cur != 0 && cur < off {
        prev = Some(cur);
        cur = next_free(map, cur)?;
    }

    let mut next_link = cur;
    if cur != 0 && off + hdr.size == cur {
        let nhdr = read_block(map, cur)?;
        hdr.size += nhdr.size;
        next_link = next_free(map, cur)?;
    }
    map.write(off, &hdr)?;
    set_next_free(map, off, next_link)?;

    match prev {
        Some(p) => {
            let phdr = read_block(map, p)?;
            if p + phdr.size == off {
                map.write(
                    p,
                    &BlockHeader {
                        size: phdr.size + hdr.size,
                        tag: TAG_FREE,
                        _pad: 0,
                    },
                )?;
                set_next_free(map, p, next_link)
            } else {
                set_next_free(map, p, off)
            }
        }
        None => map.set_alloc_root(off),
    }
}

/// Hand a newly mapped region `[start, end)` to the heap as free space,
/// merging it into a trailing free block when they touch.
pub(crate) fn extend_free(map: &mut Mapping, start: u64, end: u64) -> Result<()> {
    let mut prev: Option<u64> = None;
    let mut cur = map.alloc_root()?;
    while cur != 0 {
        prev = Some(cur);
        cur = next_free(map, cur)?;
    }
    if let Some(last) = prev {
        let hdr = read_block(map, last)?;
        if last + hdr.size == start {
            return map.write(
                last,
                &BlockHeader {
                    size: hdr.size + (end - start),
                    tag: TAG_FREE,
                    _pad: 0,
                },
            );
        }
    }
    map.write(
        start,
        &BlockHeader {
            size: end - start,
            tag: TAG_FREE,
            _pad: 0,
        },
    )?;
    set_next_free(map, start, 0)?;
    link(map, prev, start)
}

/// Walk every allocated block in address order, calling `f` with the payload
/// reference and payload bytes.
pub(crate) fn for_each(map: &Mapping, mut f: impl FnMut(Ref, &[u8])) -> Result<()> {
    let mut off = HEAP_BASE;
    while off < map.len() as u64 {
        let hdr = read_block(map, off)?;
        if hdr.tag == TAG_USED {
            let payload = map.slice(off + BLOCK_HDR as u64, hdr.size as usize - BLOCK_HDR)?;
            f(off + BLOCK_HDR as u64, payload);
        }
        off += hdr.size;
    }
    Ok(())
}

/// Heap accounting: (allocated blocks, allocated bytes, free blocks, free bytes).
pub(crate) fn stats(map: &Mapping) -> Result<(usize, usize, usize, usize)> {
    let mut out = (0, 0, 0, 0);
    let mut off = HEAP_BASE;
    while off < map.len() as u64 {
        let hdr = read_block(map, off)?;
        if hdr.tag == TAG_USED {
            out.0 += 1;
            out.1 += hdr.size as usize;
        } else {
            out.2 += 1;
            out.3 += hdr.size as usize;
        }
        off += hdr.size;
    }
    Ok(out)
}
