//! Instruction Registry - Opcodes, Sizes, Immediates, Allocation Bounds
//!
//! Every instruction is declared once below; the `insns!` macro generates
//! the enum, the opcode numbering, the immediate slot kinds (which the
//! bcode cell walker uses to find the pointers embedded in instruction
//! streams), the per-instruction maximum allocation, and the mnemonic
//! table.
//!
//! Opcode numbering discipline:
//!
//! - Plain opcodes are even: `opcode(X) = 2 * position`.
//! - Every instruction has a push-fused twin at `opcode(X) + 1` which
//!   first pushes the accumulator and then runs the plain body. The
//!   assembler's peephole pass fuses a preceding `push` by adding one to
//!   the opcode.
//! - The arity-specialized variants of the call instructions sit at fixed
//!   offsets from their generic form: `+2` for arity 0/1, `+2 * arity`
//!   for arities 2..4. The loader's pointer-resolution pass relies on
//!   this, so the declaration order of each call family below is load
//!   bearing.
//!
//! The maximum allocation of an instruction may depend on its immediate
//! words (`tuple_make` allocates its declared arity) but never on runtime
//! values; an instruction whose true demand is only known at runtime
//! (string concatenation) declares zero and raises flush-and-retry
//! instead.

use crate::cell::SlotKind;
use crate::queue::QUEUE_MAX_ALLOCATION;
use crate::trie::TRIE_MAX_ALLOCATION;
use crate::word::Word;

/// Size of a `context` cell.
pub const CONTEXT_MAX_ALLOCATION: usize = 5;

/// A priori limit on continuation frame size, in words.
pub const MAX_NUMBER_OF_WORDS_IN_CONT: usize = 254;

/// Worst case allocation of one context switch: enqueue on one queue,
/// dequeue from another, and the context cell itself.
pub const CSW_MAX_ALLOCATION: usize = 2 * QUEUE_MAX_ALLOCATION + CONTEXT_MAX_ALLOCATION;

/// Allocation of one list cons.
pub const CONS_MAX_ALLOCATION: usize = 3;

macro_rules! insns {
    ($( $name:ident $mnem:literal [$($kind:ident),*] $max:expr; )*) => {
        /// Every instruction, in opcode order.
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        #[repr(u32)]
        pub enum Insn {
            $( $name, )*
        }

        const ALL_INSNS: &[Insn] = &[ $( Insn::$name, )* ];

        impl Insn {
            /// The plain (non-fused) opcode of this instruction.
            #[inline]
            pub fn opcode(self) -> Word {
                (self as u32) * 2
            }

            /// Decode a plain (even) opcode.
            #[inline]
            pub fn from_base_opcode(op: Word) -> Option<Insn> {
                if op & 1 != 0 {
                    return None;
                }
                ALL_INSNS.get((op / 2) as usize).copied()
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Insn::$name => $mnem, )*
                }
            }

            pub fn from_mnemonic(s: &str) -> Option<Insn> {
                match s {
                    $( $mnem => Some(Insn::$name), )*
                    _ => None,
                }
            }

            /// Slot kinds of the immediate words following the opcode.
            pub fn imm_kinds(self) -> &'static [SlotKind] {
                match self {
                    $( Insn::$name => &[ $( SlotKind::$kind, )* ], )*
                }
            }

            /// Instruction size in words, opcode included.
            #[inline]
            pub fn size(self) -> usize {
                1 + self.imm_kinds().len()
            }

            /// Maximum words this instruction may allocate, given its
            /// immediate words.
            #[allow(unused_variables)]
            pub fn max_alloc(self, args: &[Word]) -> usize {
                match self {
                    $( Insn::$name => ($max)(args), )*
                }
            }
        }
    };
}

const NO_ALLOC: fn(&[Word]) -> usize = |_| 0;

insns! {
    // Stack manipulation and value loading.
    Push "push" [] NO_ALLOC;
    Drop "drop" [] NO_ALLOC;
    DropN "drop_n" [Word] NO_ALLOC;
    Pick "pick" [Word] NO_ALLOC;
    Pop "pop" [] NO_ALLOC;
    Dup "dup" [] NO_ALLOC;
    Swap "swap" [] NO_ALLOC;
    Exch "exch" [] NO_ALLOC;
    LoadImm "load_imm" [Word] NO_ALLOC;
    TLoadImm "t_load_imm" [Tagged] NO_ALLOC;
    LoadNull "load_null" [] NO_ALLOC;
    LoadImmString "load_imm_string" [NonNullPtr] NO_ALLOC;
    GetRootPtr "get_root_ptr" [Word] NO_ALLOC;
    SetRootPtr "set_root_ptr" [Word] NO_ALLOC;

    // Tagged arithmetic and comparison.
    TAdd "t_add" [] NO_ALLOC;
    TSub "t_sub" [] NO_ALLOC;
    TNeg "t_neg" [] NO_ALLOC;
    TMul "t_mul" [] NO_ALLOC;
    TDiv "t_div" [] NO_ALLOC;
    TMod "t_mod" [] NO_ALLOC;
    TAddImm "t_add_imm" [Word] NO_ALLOC;
    TSubImm "t_sub_imm" [Word] NO_ALLOC;
    TMulImm "t_mul_imm" [Word] NO_ALLOC;
    TCmpEq "t_cmpeq" [] NO_ALLOC;
    TCmpNe "t_cmpne" [] NO_ALLOC;
    TCmpLt "t_cmplt" [] NO_ALLOC;
    TCmpLe "t_cmple" [] NO_ALLOC;
    TCmpGt "t_cmpgt" [] NO_ALLOC;
    TCmpGe "t_cmpge" [] NO_ALLOC;
    TNot "t_not" [] NO_ALLOC;

    // Raw word arithmetic.
    Add "add" [] NO_ALLOC;
    Sub "sub" [] NO_ALLOC;
    Mul "mul" [] NO_ALLOC;
    Div "div" [] NO_ALLOC;
    Mod "mod" [] NO_ALLOC;
    AddImm "add_imm" [Word] NO_ALLOC;
    SubImm "sub_imm" [Word] NO_ALLOC;
    LshiftImm "lshift_imm" [Word] NO_ALLOC;
    RshiftImm "rshift_imm" [Word] NO_ALLOC;

    // Branches, forward only.
    Branch "branch" [Word] NO_ALLOC;
    Beq "beq" [Word] NO_ALLOC;
    Bne "bne" [Word] NO_ALLOC;
    Blt "blt" [Word] NO_ALLOC;
    Ble "ble" [Word] NO_ALLOC;
    Bgt "bgt" [Word] NO_ALLOC;
    Bge "bge" [Word] NO_ALLOC;
    TBranchIfFalse "t_branch_if_false" [Word] NO_ALLOC;
    TBranchIfTrue "t_branch_if_true" [Word] NO_ALLOC;
    TBranchIfNotCons "t_branch_if_not_cons" [Word] NO_ALLOC;
    TBranchIfNotNull "t_branch_if_not_null" [Word] NO_ALLOC;
    TBranchIfNotNtuple "t_branch_if_not_ntuple" [Word, Word] NO_ALLOC;

    // Lists, tuples, vectors.
    Cons "cons" [] (|_| CONS_MAX_ALLOCATION);
    RCons "r_cons" [] (|_| CONS_MAX_ALLOCATION);
    Car "car" [] NO_ALLOC;
    Cdr "cdr" [] NO_ALLOC;
    TupleMake "tuple_make" [Word] (|a: &[Word]| a[0] as usize + 1);
    TupleRef "tuple_ref" [Word] NO_ALLOC;
    MakeWordVector "make_word_vector" [Word] (|a: &[Word]| a[0] as usize + 1);

    // Objects: a field trie per object, a method trie per class under
    // the traits global.
    MakeNewProto "make_new_proto" [Word] (|_| 2);
    GetObjField "get_obj_field" [Word] NO_ALLOC;
    InsertObjField "insert_obj_field" [Word] (|_| TRIE_MAX_ALLOCATION + 2);
    RebindObjField "rebind_obj_field" [Word] (|_| TRIE_MAX_ALLOCATION + 2);
    GetObjMethod "get_obj_method" [Word, Word] NO_ALLOC;

    // Globals, through the two-way associative cache.
    GetGlobal "get_global" [Word] NO_ALLOC;
    SetGlobal "set_global" [Word] (|_| TRIE_MAX_ALLOCATION);

    // Word-keyed tries from byte code.
    TrieInsert "trie_insert" [] (|_| TRIE_MAX_ALLOCATION);
    TrieFind "trie_find" [] NO_ALLOC;

    // Strings.
    StringAppend "string_append" [] NO_ALLOC;
    IntToString "int_to_string" [] (|_| 300);
    StringCmp "string_cmp" [] NO_ALLOC;
    StringLength "string_length" [] NO_ALLOC;

    // Calls. Declaration order inside each family is load bearing: the
    // generic form first, then the arity specializations at +2, +4, +6,
    // +8 in opcode space.
    Bind "bind" [Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    Call "call" [Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    TailCall "tail_call" [Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    Return "return" [] NO_ALLOC;
    GotoBcode "goto_bcode" [Word] NO_ALLOC;
    GotoSelf "goto_self" [] NO_ALLOC;

    CallGlobal "call_global" [Word, Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    CallGlobal01 "call_global01" [Word, Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    CallGlobal2 "call_global2" [Word, Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    CallGlobal3 "call_global3" [Word, Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    CallGlobal4 "call_global4" [Word, Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);

    CallGlobalPtr "call_global_ptr" [NonNullPtr, Word, NonNullPtr] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    CallGlobalPtr01 "call_global_ptr01" [NonNullPtr, Word, NonNullPtr] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    CallGlobalPtr2 "call_global_ptr2" [NonNullPtr, Word, NonNullPtr] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    CallGlobalPtr3 "call_global_ptr3" [NonNullPtr, Word, NonNullPtr] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    CallGlobalPtr4 "call_global_ptr4" [NonNullPtr, Word, NonNullPtr] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);

    TailCallGlobal "tail_call_global" [Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    TailCallGlobal01 "tail_call_global01" [Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    TailCallGlobal2 "tail_call_global2" [Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    TailCallGlobal3 "tail_call_global3" [Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    TailCallGlobal4 "tail_call_global4" [Word, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);

    TailCallGlobalPtr "tail_call_global_ptr" [NonNullPtr, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    TailCallGlobalPtr01 "tail_call_global_ptr01" [NonNullPtr, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    TailCallGlobalPtr2 "tail_call_global_ptr2" [NonNullPtr, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    TailCallGlobalPtr3 "tail_call_global_ptr3" [NonNullPtr, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);
    TailCallGlobalPtr4 "tail_call_global_ptr4" [NonNullPtr, Word] (|_| MAX_NUMBER_OF_WORDS_IN_CONT);

    // Threads.
    Spawn "spawn" [Word, Word, Word]
        (|_| MAX_NUMBER_OF_WORDS_IN_CONT + CONTEXT_MAX_ALLOCATION + QUEUE_MAX_ALLOCATION);
    Die "die" [] NO_ALLOC;
    Exit "exit" [] NO_ALLOC;

    // Network I/O. The immediate is the fatal-error branch target.
    NetListen "net_listen" [Word] NO_ALLOC;
    NetAccept "net_accept" [Word] (|_| CONTEXT_MAX_ALLOCATION + TRIE_MAX_ALLOCATION);
    NetReadChar "net_read_char" [Word] (|_| CONTEXT_MAX_ALLOCATION + TRIE_MAX_ALLOCATION);
    NetWriteChar "net_write_char" [Word] (|_| CONTEXT_MAX_ALLOCATION + TRIE_MAX_ALLOCATION);
    NetClose "net_close" [] (|_| CONTEXT_MAX_ALLOCATION + TRIE_MAX_ALLOCATION);

    // Printing, useful for debugging byte code.
    TPrint "t_print" [] NO_ALLOC;
    PrintInt "print_int" [] NO_ALLOC;
}

/// Decode any opcode word into its instruction and whether it is the
/// push-fused variant.
#[inline]
pub fn decode(op: Word) -> Option<(Insn, bool)> {
    let fused = op & 1 == 1;
    Insn::from_base_opcode(op & !1).map(|i| (i, fused))
}

/// The arity-specialization opcode offset for a call of `nargs`
/// arguments, or 0 when no specialized variant exists.
#[inline]
pub fn arity_offset(nargs: Word) -> Word {
    match nargs {
        0 | 1 => 2,
        2..=4 => 2 * nargs,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_fused_twin_is_plain_plus_one() {
        for &insn in ALL_INSNS {
            let plain = insn.opcode();
            assert_eq!(plain & 1, 0);
            let (decoded, fused) = decode(plain).unwrap();
            assert_eq!(decoded, insn);
            assert!(!fused);
            let (decoded, fused) = decode(plain + 1).unwrap();
            assert_eq!(decoded, insn, "push_and twin decodes to a different insn");
            assert!(fused);
        }
        assert!(decode(ALL_INSNS.len() as Word * 2).is_none());
    }

    #[test]
    fn test_arity_specialization_offsets() {
        for (generic, specialized) in [
            (Insn::CallGlobal, &[
                Insn::CallGlobal01,
                Insn::CallGlobal2,
                Insn::CallGlobal3,
                Insn::CallGlobal4,
            ]),
            (Insn::CallGlobalPtr, &[
                Insn::CallGlobalPtr01,
                Insn::CallGlobalPtr2,
                Insn::CallGlobalPtr3,
                Insn::CallGlobalPtr4,
            ]),
            (Insn::TailCallGlobal, &[
                Insn::TailCallGlobal01,
                Insn::TailCallGlobal2,
                Insn::TailCallGlobal3,
                Insn::TailCallGlobal4,
            ]),
            (Insn::TailCallGlobalPtr, &[
                Insn::TailCallGlobalPtr01,
                Insn::TailCallGlobalPtr2,
                Insn::TailCallGlobalPtr3,
                Insn::TailCallGlobalPtr4,
            ]),
        ] {
            let base = generic.opcode();
            assert_eq!(specialized[0].opcode(), base + arity_offset(0));
            assert_eq!(specialized[0].opcode(), base + arity_offset(1));
            assert_eq!(specialized[1].opcode(), base + arity_offset(2));
            assert_eq!(specialized[2].opcode(), base + arity_offset(3));
            assert_eq!(specialized[3].opcode(), base + arity_offset(4));
        }
    }

    #[test]
    fn test_sizes_follow_immediates() {
        assert_eq!(Insn::Push.size(), 1);
        assert_eq!(Insn::Pick.size(), 2);
        assert_eq!(Insn::CallGlobal.size(), 4);
        assert_eq!(Insn::TBranchIfNotNtuple.size(), 3);
    }

    #[test]
    fn test_mnemonic_round_trip() {
        for &insn in ALL_INSNS {
            assert_eq!(Insn::from_mnemonic(insn.mnemonic()), Some(insn));
        }
        assert!(Insn::from_mnemonic("no_such_insn").is_none());
    }

    #[test]
    fn test_argument_dependent_max_alloc() {
        assert_eq!(Insn::TupleMake.max_alloc(&[3]), 4);
        assert_eq!(Insn::MakeWordVector.max_alloc(&[10]), 11);
        assert_eq!(Insn::Push.max_alloc(&[]), 0);
        assert_eq!(Insn::SetGlobal.max_alloc(&[0]), TRIE_MAX_ALLOCATION);
    }
}
