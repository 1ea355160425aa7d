//! Cell Model - Tagged Cells and the Type Registry
//!
//! Every persistent datum is a cell: a contiguous run of words whose first
//! word is the header. The high 8 bits of the header carry the type tag,
//! the low 24 bits are per-type data (a length, an arity, a small key).
//!
//! The registry below is the single declaration each cell type gets. From
//! it the `cells!` macro generates the tag enum, the size dispatch and the
//! slot walker, so the garbage collector, the recovery scan and the
//! debugging printer all agree on every layout by construction.
//!
//! Rules for a size expression: it may read the header word and, for
//! `bcode` and `cont`, a bounded number of following words, but nothing
//! else; it must not allocate, mutate or suspend. No cell is smaller than
//! two words or as large as a page (the root block region is not a cell).
//!
//! A walker visits every non-header word once with its slot kind. Walk
//! bodies that chase a pointer (the `cont` walker consults its `bcode` for
//! the live stack depth) must look through forward pointers, which are
//! present during the commit copy window.

use crate::heap::Heap;
use crate::word::{Ptr, Word};

pub const CELL_TYPE_BITS: u32 = 8;
pub const CELL_TYPE_MASK: Word = 0xFF00_0000;

/// Minimum size of any cell, in words.
pub const MIN_CELL_WORDS: usize = 2;

/// Word-level kind of one cell slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotKind {
    /// Raw data, copied verbatim.
    Word,
    /// Owning pointer, possibly null.
    Ptr,
    /// Owning pointer, never null.
    NonNullPtr,
    /// Tagged value: a pointer when the low two bits are 00, raw otherwise.
    Tagged,
}

/// Word type of the accumulator and of bcode stack slots.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum WordType {
    Word = 0,
    Ptr = 1,
    NonNullPtr = 2,
    Tagged = 3,
    Void = 4,
}

pub const NUMBER_OF_WORD_TYPES: Word = 5;

impl WordType {
    /// Decode a persisted word type. An unknown value is a bytecode
    /// producer bug and fatal.
    pub fn from_word(w: Word) -> WordType {
        match w {
            0 => WordType::Word,
            1 => WordType::Ptr,
            2 => WordType::NonNullPtr,
            3 => WordType::Tagged,
            4 => WordType::Void,
            _ => panic!("invalid word type {w}"),
        }
    }

    /// The slot kind this word type contributes to a cell layout, if any.
    pub fn slot_kind(self) -> Option<SlotKind> {
        match self {
            WordType::Word => Some(SlotKind::Word),
            WordType::Ptr => Some(SlotKind::Ptr),
            WordType::NonNullPtr => Some(SlotKind::NonNullPtr),
            WordType::Tagged => Some(SlotKind::Tagged),
            WordType::Void => None,
        }
    }
}

/// Build a header word from a tag and its low 24 data bits.
#[inline]
pub fn make_header(t: CellType, data: Word) -> Word {
    ((t as Word) << 24) | (data & 0x00FF_FFFF)
}

/// The low 24 data bits of a header word.
#[inline]
pub fn header_data(p0: Word) -> Word {
    p0 & 0x00FF_FFFF
}

macro_rules! cells {
    ($(
        $(#[doc = $doc:literal])*
        $name:ident = $tag:literal {
            size($sh:ident, $sp:ident, $sp0:ident) $size:block
            walk($wh:ident, $wp:ident, $wp0:ident, $wv:ident) $walk:block
        }
    )*) => {
        /// Every cell type the recovery and commit algorithms understand.
        ///
        /// The discriminant is the 8-bit tag stored in the header; the
        /// compiler refuses duplicate tags.
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        #[repr(u8)]
        pub enum CellType {
            $( $(#[doc = $doc])* $name = $tag, )*
        }

        impl CellType {
            /// Decode a tag byte. `None` for a tag no registry entry claims.
            pub fn from_tag(tag: u8) -> Option<CellType> {
                match tag {
                    $( $tag => Some(CellType::$name), )*
                    _ => None,
                }
            }

            /// Cell type of a header word; an unregistered tag is heap
            /// corruption and fatal.
            #[inline]
            pub fn of_header(p0: Word) -> CellType {
                let tag = (p0 >> 24) as u8;
                match CellType::from_tag(tag) {
                    Some(t) => t,
                    None => panic!("unregistered cell tag {tag} in header {p0:#010x}"),
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( CellType::$name => stringify!($name), )*
                }
            }
        }

        /// Size of the cell at `p`, in words including the header.
        #[allow(unused_variables)]
        pub fn size_words(heap: &Heap, p: Ptr) -> usize {
            let p0 = heap.word(p);
            match CellType::of_header(p0) {
                $( CellType::$name => {
                    let f = |$sh: &Heap, $sp: Ptr, $sp0: Word| -> usize { $size };
                    f(heap, p, p0)
                } )*
            }
        }

        /// Invoke `visit(kind, word_offset)` for every non-header word of
        /// the cell at `p`. Never allocates, mutates or suspends.
        #[allow(unused_variables)]
        pub fn walk_cell(heap: &Heap, p: Ptr, visit: &mut dyn FnMut(SlotKind, usize)) {
            let p0 = heap.word(p);
            match CellType::of_header(p0) {
                $( CellType::$name => {
                    let mut f = |$wh: &Heap, $wp: Ptr, $wp0: Word, $wv: &mut dyn FnMut(SlotKind, usize)| $walk;
                    f(heap, p, p0, visit)
                } )*
            }
        }
    };
}

cells! {
    /// Trap type: tag zero means uninitialized memory reached the walker.
    Bonk = 0 {
        size(_h, _p, _p0) { panic!("walked a bonk cell") }
        walk(_h, _p, _p0, _v) { panic!("walked a bonk cell") }
    }

    /// A three-word LISP list node.
    List = 1 {
        size(_h, _p, _p0) { 3 }
        walk(_h, _p, _p0, v) {
            v(SlotKind::Tagged, 1); // car
            v(SlotKind::Tagged, 2); // cdr
        }
    }

    /// An object: the low 24 header bits are its class id, word 1 the
    /// field trie.
    Object = 2 {
        size(_h, _p, _p0) { 2 }
        walk(_h, _p, _p0, v) { v(SlotKind::Ptr, 1); }
    }

    /// A vector of raw words; the low 24 header bits give the length.
    WordVector = 3 {
        size(_h, _p, p0) { (header_data(p0) as usize) + 1 }
        walk(_h, _p, p0, v) {
            for i in 1..=header_data(p0) as usize {
                v(SlotKind::Word, i);
            }
        }
    }

    /// Tuples and records: header bits 0..11 count tagged slots, bits
    /// 12..23 count raw slots following them.
    Tuple = 4 {
        size(_h, _p, p0) {
            ((p0 & 0xFFF) + ((p0 >> 12) & 0xFFF)) as usize + 1
        }
        walk(_h, _p, p0, v) {
            let tagged = (p0 & 0xFFF) as usize;
            let raw = ((p0 >> 12) & 0xFFF) as usize;
            for i in 1..=tagged {
                v(SlotKind::Tagged, i);
            }
            for i in 1..=raw {
                v(SlotKind::Word, tagged + i);
            }
        }
    }

    /// A node of the 4-way trie.
    QuadTrie = 5 {
        size(_h, _p, _p0) { 5 }
        walk(_h, _p, _p0, v) {
            v(SlotKind::Ptr, 1);
            v(SlotKind::Ptr, 2);
            v(SlotKind::Ptr, 3);
            v(SlotKind::Ptr, 4);
        }
    }

    /// Header of a stable FIFO queue.
    Queue = 6 {
        size(_h, _p, _p0) { 5 }
        walk(_h, _p, _p0, v) {
            v(SlotKind::Ptr, 1);  // front list
            v(SlotKind::Ptr, 2);  // rear list
            v(SlotKind::Word, 3); // front count
            v(SlotKind::Word, 4); // rear count
        }
    }

    /// Header of a queue whose incremental reversal is in progress.
    QueueRev = 7 {
        size(_h, _p, _p0) { 11 }
        walk(_h, _p, _p0, v) {
            v(SlotKind::Ptr, 1);   // working front
            v(SlotKind::Ptr, 2);   // new rear
            v(SlotKind::Word, 3);  // front count
            v(SlotKind::Word, 4);  // rear count
            v(SlotKind::Ptr, 5);   // old front being reversed
            v(SlotKind::Ptr, 6);   // old front reversed so far
            v(SlotKind::Ptr, 7);   // old rear being reversed
            v(SlotKind::Ptr, 8);   // new front accumulated
            v(SlotKind::Word, 9);  // count of still-valid reversed items
            v(SlotKind::Word, 10); // rotation phase
        }
    }

    /// The shtring descriptor.
    Shtring = 8 {
        size(_h, _p, _p0) { 5 }
        walk(_h, _p, _p0, v) {
            v(SlotKind::Word, 1); // starting offset in the chunk sequence
            v(SlotKind::Word, 2); // length of the described substring
            v(SlotKind::Word, 3); // height of the chunk tree
            v(SlotKind::Ptr, 4);  // root of the chunk tree
        }
    }

    /// A chunk of string bytes; the low 24 header bits give the byte
    /// length.
    ShtringChunk = 9 {
        size(_h, _p, p0) { (header_data(p0) as usize).div_ceil(4) + 1 }
        walk(_h, _p, p0, v) {
            for i in 1..=(header_data(p0) as usize).div_ceil(4) {
                v(SlotKind::Word, i);
            }
        }
    }

    /// An interior node of a chunk tree; the low 8 header bits count the
    /// children.
    ShtringNode = 10 {
        size(_h, _p, p0) { (p0 & 0xFF) as usize + 3 }
        walk(_h, _p, p0, v) {
            v(SlotKind::Word, 1); // sum of chunk lengths below
            v(SlotKind::Word, 2); // height of this subtree
            for i in 1..=(p0 & 0xFF) as usize {
                v(SlotKind::NonNullPtr, 2 + i);
            }
        }
    }

    /// Root of the interning structure.
    ShtringInternRoot = 11 {
        size(_h, _p, _p0) { 4 }
        walk(_h, _p, _p0, v) {
            v(SlotKind::Ptr, 1);  // trie keyed by hash
            v(SlotKind::Ptr, 2);  // trie keyed by intern id
            v(SlotKind::Word, 3); // number of shtrings interned so far
        }
    }

    /// Node in the list of shtrings sharing one hash value.
    ShtringInternNode = 12 {
        size(_h, _p, _p0) { 4 }
        walk(_h, _p, _p0, v) {
            v(SlotKind::Ptr, 1);        // next node in the list
            v(SlotKind::NonNullPtr, 2); // the interned shtring
            v(SlotKind::Word, 3);       // its intern id
        }
    }

    /// A compiled routine. The low 24 header bits carry the bcode id for
    /// debugging; the instruction stream declares its own immediates, so
    /// the walker decodes opcodes to find the pointer-valued ones.
    Bcode = 13 {
        size(h, p, _p0) {
            (h.word_at(p, 2) + h.word_at(p, 3)) as usize + 7
        }
        walk(h, p, _p0, v) {
            v(SlotKind::Word, 1); // accu type
            v(SlotKind::Word, 2); // entry stack depth
            v(SlotKind::Word, 3); // code length
            v(SlotKind::Word, 4); // cont is reusable
            v(SlotKind::Word, 5); // maximum allocation
            v(SlotKind::Word, 6); // cont size in words
            let code_len = h.word_at(p, 3) as usize;
            let mut off = 7;
            while off < 7 + code_len {
                let opw = h.word_at(p, off);
                v(SlotKind::Word, off);
                let insn = crate::vm::insn::decode(opw)
                    .unwrap_or_else(|| panic!("undecodable opcode {opw} in bcode cell"))
                    .0;
                for (j, kind) in insn.imm_kinds().iter().enumerate() {
                    v(*kind, off + 1 + j);
                }
                off += insn.size();
            }
            for i in 0..h.word_at(p, 2) as usize {
                v(SlotKind::Word, 7 + code_len + i); // stack type vector
            }
        }
    }

    /// A continuation frame. Header bits 12..23 are the total size in
    /// words; bits 0..11 the current stack depth, with 0xFFF meaning
    /// "fully populated, currently executing" so the live depth comes
    /// from the bcode.
    Cont = 14 {
        size(_h, _p, p0) { ((p0 >> 12) & 0xFFF) as usize }
        walk(h, p, p0, v) {
            v(SlotKind::NonNullPtr, 1); // bcode
            v(SlotKind::Ptr, 2);        // return-to continuation
            let mut bc = Ptr::from_word(h.word_at(p, 1));
            if h.type_of(bc) == CellType::ForwardPointer {
                bc = Ptr::from_word(h.word_at(bc, 1));
            }
            let depth = if p0 & 0xFFF == 0xFFF {
                h.word_at(bc, 2) as usize
            } else {
                (p0 & 0xFFF) as usize
            };
            let types_at = 7 + h.word_at(bc, 3) as usize;
            for i in 0..depth {
                let ty = WordType::from_word(h.word_at(bc, types_at + i));
                if let Some(kind) = ty.slot_kind() {
                    v(kind, 3 + i);
                }
            }
        }
    }

    /// A runnable thread: its cont, accumulator, thread id and priority.
    /// The low 24 header bits hold the accumulator's word type.
    Context = 15 {
        size(_h, _p, _p0) { 5 }
        walk(_h, _p, p0, v) {
            v(SlotKind::NonNullPtr, 1); // cont
            let ty = WordType::from_word(header_data(p0));
            if let Some(kind) = ty.slot_kind() {
                v(kind, 2); // accu
            }
            v(SlotKind::Word, 3); // thread id
            v(SlotKind::Word, 4); // priority
        }
    }

    /// Persistent per-generation info: the low 12 header bits count the
    /// (memory page, disk page) pairs that follow.
    GenerationPinfo = 16 {
        size(_h, _p, p0) { 4 + 2 * (p0 & 0xFFF) as usize }
        walk(_h, _p, p0, v) {
            v(SlotKind::Ptr, 1);  // previous generation in the list
            v(SlotKind::Word, 2); // generation number
            v(SlotKind::Word, 3); // number of referring pointers
            for i in 0..(p0 & 0xFFF) as usize {
                v(SlotKind::Word, 4 + 2 * i);     // memory page number
                v(SlotKind::Word, 4 + 2 * i + 1); // disk page number
            }
        }
    }

    /// Reserved for the collector: the cell has moved and word 1 holds the
    /// new address. Valid only during the commit copy window; nothing
    /// walks one.
    ForwardPointer = 17 {
        size(_h, _p, _p0) { 2 }
        walk(_h, _p, _p0, _v) { panic!("walked a forward pointer") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::heap::Heap;

    fn small_heap() -> Heap {
        let mut params = Params::default();
        params.db_size = 256 * 1024;
        params.first_generation_size = 64 * 1024;
        Heap::create(params).unwrap()
    }

    #[test]
    fn test_tag_round_trip() {
        for tag in 0..=255u8 {
            if let Some(t) = CellType::from_tag(tag) {
                assert_eq!(t as u8, tag);
                assert_eq!(CellType::of_header(make_header(t, 0x123)), t);
            }
        }
        assert_eq!(CellType::from_tag(0), Some(CellType::Bonk));
        assert!(CellType::from_tag(200).is_none());
    }

    #[test]
    fn test_word_vector_size_and_walk() {
        let mut h = small_heap();
        assert!(h.can_allocate(4));
        let p = h.allocate(4, CellType::WordVector);
        let p0 = h.word(p);
        h.set_word(p, p0 | 3);
        assert_eq!(size_words(&h, p), 4);
        let mut slots = Vec::new();
        walk_cell(&h, p, &mut |k, i| slots.push((k, i)));
        assert_eq!(
            slots,
            vec![
                (SlotKind::Word, 1),
                (SlotKind::Word, 2),
                (SlotKind::Word, 3)
            ]
        );
    }

    #[test]
    fn test_tuple_size_and_walk() {
        let mut h = small_heap();
        let p = h.allocate(4, CellType::Tuple);
        // two tagged slots, one raw slot
        let p0 = h.word(p);
        h.set_word(p, p0 | 2 | (1 << 12));
        assert_eq!(size_words(&h, p), 4);
        let mut slots = Vec::new();
        walk_cell(&h, p, &mut |k, i| slots.push((k, i)));
        assert_eq!(
            slots,
            vec![
                (SlotKind::Tagged, 1),
                (SlotKind::Tagged, 2),
                (SlotKind::Word, 3)
            ]
        );
    }

    #[test]
    fn test_shtring_chunk_size_rounds_up() {
        let mut h = small_heap();
        let p = h.allocate(3, CellType::ShtringChunk);
        let p0 = h.word(p);
        h.set_word(p, p0 | 5); // five bytes round up to two payload words
        assert_eq!(size_words(&h, p), 3);
    }

    #[test]
    fn test_word_type_decode() {
        assert_eq!(WordType::from_word(3), WordType::Tagged);
        assert_eq!(WordType::Void.slot_kind(), None);
        assert_eq!(WordType::Ptr.slot_kind(), Some(SlotKind::Ptr));
    }

    #[test]
    #[should_panic]
    fn test_invalid_word_type_panics() {
        WordType::from_word(9);
    }
}
