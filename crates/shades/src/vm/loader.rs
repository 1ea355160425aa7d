//! Bytecode Loader - From Assembled Words to Registered `bcode` Cells
//!
//! The loader accepts the assembler's wire form: a raw instruction word
//! vector plus the entry stack type vector and metadata. It validates the
//! stream (accumulating every problem rather than stopping at the
//! first), computes the sequence's maximum allocation as the sum of its
//! instructions' declared maxima plus the context-switch overhead,
//! resolves immediate string ids to interned shtring pointers, installs
//! the `bcode` cell under its interned name, and for entry points also
//! installs the zero-argument prototype continuation in `globals`.
//!
//! Call instructions are loaded in their generic, id-keyed form and
//! rewritten in place to the pointer-resolved, arity-specialized form
//! once both the callee prototype and the continuation bcode exist. A
//! bcode that still contains unresolved calls stays on the pending list
//! and resolution is retried after every load and every commit (cell
//! addresses move, but the embedded pointers are declared to the cell
//! walker, so commits patch the already-resolved ones themselves).

use crate::cell::{CellType, WordType};
use crate::error::{LoadErrors, LoadProblem, Result, ShadesError};
use crate::heap::Heap;
use crate::root::RootId;
use crate::shtring::{
    shtring_create, shtring_create_max_allocation, shtring_intern,
    shtring_lookup_by_intern_id, SHTRING_INTERN_MAX_ALLOCATION,
};
use crate::trie::{trie_find, trie_insert, TRIE_MAX_ALLOCATION};
use crate::word::{Ptr, Word};

use super::insn::{self, Insn, CSW_MAX_ALLOCATION, MAX_NUMBER_OF_WORDS_IN_CONT};
use super::Vm;

/// Load one assembled routine and register it under `name`.
///
/// Returns the bcode id (the interned id of the name). Fails with a
/// recoverable [`ShadesError::FirstGenerationFull`] when the batch
/// cannot hold the cells; the caller may `flush_batch` and retry.
#[allow(clippy::too_many_arguments)]
pub fn load_bcode(
    heap: &mut Heap,
    vm: &mut Vm,
    name: &str,
    accu_type: WordType,
    cont_is_reusable: bool,
    bcode_is_entry: bool,
    stack_types: &[WordType],
    max_stack_depth: usize,
    code: &[Word],
) -> Result<Word> {
    let cur_stack_depth = stack_types.len();
    let mut problems = validate_stream(code);
    if cur_stack_depth > max_stack_depth {
        problems.push(LoadProblem::StackTooDeep {
            words: cur_stack_depth,
            limit: max_stack_depth,
        });
    }
    if 3 + max_stack_depth > MAX_NUMBER_OF_WORDS_IN_CONT {
        problems.push(LoadProblem::StackTooDeep {
            words: 3 + max_stack_depth,
            limit: MAX_NUMBER_OF_WORDS_IN_CONT,
        });
    }
    // A cell may never reach a full page.
    let cell_words = 7 + cur_stack_depth + code.len();
    let page_words = heap.params().page_size / 4;
    if cell_words >= page_words {
        problems.push(LoadProblem::CodeTooLong {
            words: cell_words,
            limit: page_words,
        });
    }

    // Pre-flight the whole load: bcode cell, name shtring, interning,
    // the bcodes trie insert, and for entry points the prototype cont
    // plus its globals insert.
    let mut n_words = 7
        + cur_stack_depth
        + code.len()
        + TRIE_MAX_ALLOCATION
        + shtring_create_max_allocation(name.len())
        + SHTRING_INTERN_MAX_ALLOCATION;
    if bcode_is_entry {
        n_words += 3 + max_stack_depth + TRIE_MAX_ALLOCATION;
    }
    if !heap.can_allocate(n_words) {
        return Err(ShadesError::FirstGenerationFull {
            requested: n_words,
            available: heap.first_generation_free_words(),
        });
    }

    // Resolve immediate string ids to interned shtring pointers and sum
    // the allocation bound, in one validated walk.
    let mut words: Vec<Word> = code.to_vec();
    let mut max_allocation = 0usize;
    let mut pc = 0usize;
    while pc < words.len() {
        let Some((op, _)) = insn::decode(words[pc]) else {
            break; // already reported by validate_stream
        };
        if pc + op.size() > words.len() {
            break;
        }
        max_allocation += op.max_alloc(&words[pc + 1..pc + op.size()]);
        if op == Insn::LoadImmString {
            let id = words[pc + 1];
            let s = shtring_lookup_by_intern_id(heap, heap.root_ptr(RootId::InternedShtrings), id);
            if s.is_null() {
                problems.push(LoadProblem::UnknownString { word: pc + 1, id });
            } else {
                words[pc + 1] = s.to_word();
            }
        }
        pc += op.size();
    }
    max_allocation += CSW_MAX_ALLOCATION;

    // Intern the name now so the duplicate-entry check can see it.
    let name_cell = shtring_create(heap, name.as_bytes());
    let intern_root = heap.root_ptr(RootId::InternedShtrings);
    let intern = shtring_intern(heap, intern_root, name_cell);
    heap.set_root_ptr(RootId::InternedShtrings, intern.new_root);
    let id = intern.id;

    if bcode_is_entry && trie_find(heap, heap.root_ptr(RootId::Globals), id) != 0 {
        problems.push(LoadProblem::DuplicateEntryPoint {
            name: name.to_string(),
        });
    }
    if !problems.is_empty() {
        return Err(LoadErrors(problems).into());
    }

    // Build the bcode cell.
    let b = heap.allocate(7 + cur_stack_depth + words.len(), CellType::Bcode);
    heap.set_word_at(b, 1, accu_type as Word);
    heap.set_word_at(b, 2, cur_stack_depth as Word);
    heap.set_word_at(b, 3, words.len() as Word);
    heap.set_word_at(b, 4, cont_is_reusable as Word);
    heap.set_word_at(b, 5, max_allocation as Word);
    heap.set_word_at(b, 6, (3 + max_stack_depth) as Word);
    for (i, &w) in words.iter().enumerate() {
        heap.set_word_at(b, 7 + i, w);
    }
    for (i, &t) in stack_types.iter().enumerate() {
        heap.set_word_at(b, 7 + words.len() + i, t as Word);
    }
    // The id rides in the header's low bits for backtraces.
    let header = heap.word(b);
    heap.set_word(b, header | (id & 0x00FF_FFFF));

    vm.caches.flush_bcode();
    let bcodes = heap.root_ptr(RootId::Bcodes);
    let bcodes = trie_insert(heap, bcodes, id, b.to_word());
    heap.set_root_ptr(RootId::Bcodes, bcodes);

    if heap.params().be_verbose || vm.show_bcode_ids {
        log::info!("bcode name {name:?} has been assigned bcode id {id}");
    }

    // An entry point gets a prototype cont with no arguments bound.
    if bcode_is_entry {
        let proto = heap.allocate(3 + max_stack_depth, CellType::Cont);
        let header = heap.word(proto);
        heap.set_word(proto, header | (((3 + max_stack_depth) as Word) << 12));
        heap.set_word_at(proto, 1, b.to_word());
        heap.set_word_at(proto, 2, 0);
        vm.caches.flush_global();
        let globals = heap.root_ptr(RootId::Globals);
        let globals = trie_insert(heap, globals, id, proto.to_word());
        heap.set_root_ptr(RootId::Globals, globals);
    }

    vm.pending_bcodes.push(id);
    resolve_pending(heap, vm);
    Ok(id)
}

/// Intern a host string, creating it on the heap if needed, and return
/// its id. The way immediate strings get their ids before `load_bcode`
/// sees the code.
pub fn intern_string(heap: &mut Heap, bytes: &[u8]) -> Result<Word> {
    let need = shtring_create_max_allocation(bytes.len()) + SHTRING_INTERN_MAX_ALLOCATION;
    if !heap.can_allocate(need) {
        return Err(ShadesError::FirstGenerationFull {
            requested: need,
            available: heap.first_generation_free_words(),
        });
    }
    let s = shtring_create(heap, bytes);
    let intern_root = heap.root_ptr(RootId::InternedShtrings);
    let r = shtring_intern(heap, intern_root, s);
    heap.set_root_ptr(RootId::InternedShtrings, r.new_root);
    Ok(r.id)
}

/// Structural validation of a raw instruction stream.
fn validate_stream(code: &[Word]) -> Vec<LoadProblem> {
    let mut problems = Vec::new();
    let mut boundaries = vec![false; code.len() + 1];
    let mut branch_sites: Vec<(usize, usize)> = Vec::new();
    let mut pc = 0usize;
    while pc < code.len() {
        boundaries[pc] = true;
        let Some((op, _)) = insn::decode(code[pc]) else {
            problems.push(LoadProblem::UnknownOpcode {
                word: pc,
                opcode: code[pc],
            });
            return problems;
        };
        if pc + op.size() > code.len() {
            problems.push(LoadProblem::TruncatedInsn {
                word: pc,
                needed: op.size(),
                remaining: code.len() - pc,
            });
            return problems;
        }
        let label_imm = match op {
            Insn::Branch
            | Insn::Beq
            | Insn::Bne
            | Insn::Blt
            | Insn::Ble
            | Insn::Bgt
            | Insn::Bge
            | Insn::TBranchIfFalse
            | Insn::TBranchIfTrue
            | Insn::TBranchIfNotCons
            | Insn::TBranchIfNotNull
            | Insn::NetListen
            | Insn::NetAccept
            | Insn::NetReadChar
            | Insn::NetWriteChar => Some(0),
            Insn::TBranchIfNotNtuple => Some(1),
            _ => None,
        };
        if let Some(k) = label_imm {
            branch_sites.push((pc, code[pc + 1 + k] as usize));
        }
        pc += op.size();
    }
    boundaries[code.len()] = true;
    for (site, target) in branch_sites {
        if target > code.len() || !boundaries[target] {
            problems.push(LoadProblem::BadBranchTarget { word: site, target });
        } else if target <= site {
            problems.push(LoadProblem::BackwardBranch { word: site, target });
        }
    }
    problems
}

/// Retry pointer resolution for every pending bcode. Called after every
/// load and after every commit.
pub fn resolve_pending(heap: &mut Heap, vm: &mut Vm) {
    let pending = std::mem::take(&mut vm.pending_bcodes);
    let mut still_pending = Vec::new();
    for id in pending {
        let b = Ptr::from_word(trie_find(heap, heap.root_ptr(RootId::Bcodes), id));
        if b.is_null() {
            continue;
        }
        if !resolve_bcode(heap, b) {
            still_pending.push(id);
        }
    }
    vm.pending_bcodes = still_pending;
}

/// Rewrite the generic call instructions of one bcode to their
/// pointer-resolved, arity-specialized forms where both the callee
/// prototype and the continuation bcode are known. Returns true when no
/// generic call remains.
fn resolve_bcode(heap: &mut Heap, b: Ptr) -> bool {
    let code_len = super::bcode_code_len(heap, b);
    let globals = heap.root_ptr(RootId::Globals);
    let bcodes = heap.root_ptr(RootId::Bcodes);
    let mut fully_resolved = true;
    let mut changed = false;
    let mut pc = 0usize;
    while pc < code_len {
        let opw = heap.word_at(b, 7 + pc);
        let (op, fused) = insn::decode(opw).expect("undecodable insn in loaded bcode");
        match op {
            Insn::CallGlobal => {
                let to = trie_find(heap, globals, heap.word_at(b, 7 + pc + 1));
                let nargs = heap.word_at(b, 7 + pc + 2);
                let next = trie_find(heap, bcodes, heap.word_at(b, 7 + pc + 3));
                if to != 0 && next != 0 {
                    let new_op = Insn::CallGlobalPtr.opcode()
                        + insn::arity_offset(nargs)
                        + fused as Word;
                    heap.set_word_at(b, 7 + pc, new_op);
                    heap.set_word_at(b, 7 + pc + 1, to);
                    heap.set_word_at(b, 7 + pc + 3, next);
                    changed = true;
                } else {
                    fully_resolved = false;
                }
            }
            Insn::TailCallGlobal => {
                let to = trie_find(heap, globals, heap.word_at(b, 7 + pc + 1));
                let nargs = heap.word_at(b, 7 + pc + 2);
                if to != 0 {
                    let new_op = Insn::TailCallGlobalPtr.opcode()
                        + insn::arity_offset(nargs)
                        + fused as Word;
                    heap.set_word_at(b, 7 + pc, new_op);
                    heap.set_word_at(b, 7 + pc + 1, to);
                    changed = true;
                } else {
                    fully_resolved = false;
                }
            }
            _ => {}
        }
        pc += op.size();
    }
    if changed {
        // A committed bcode was rewritten in place; its page must reach
        // the disk again.
        heap.mark_ptr_page_dirty(b);
    }
    fully_resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::vm::{bcode_max_alloc, bcode_stack_depth, cont_size_words};

    fn test_heap() -> Heap {
        let mut p = Params::default();
        p.db_size = 4 * 1024 * 1024;
        p.first_generation_size = 1024 * 1024;
        Heap::create(p).unwrap()
    }

    fn op(i: Insn) -> Word {
        i.opcode()
    }

    #[test]
    fn test_load_simple_bcode() {
        let mut h = test_heap();
        let mut vm = Vm::new();
        let code = vec![
            op(Insn::TLoadImm),
            crate::word::signed_to_tagged(7),
            op(Insn::Return),
        ];
        let id = load_bcode(
            &mut h,
            &mut vm,
            "just-seven",
            WordType::Tagged,
            false,
            true,
            &[],
            2,
            &code,
        )
        .unwrap();
        assert!(id > 0);
        let b = Ptr::from_word(trie_find(&h, h.root_ptr(RootId::Bcodes), id));
        assert!(!b.is_null());
        assert_eq!(bcode_stack_depth(&h, b), 0);
        assert_eq!(bcode_max_alloc(&h, b), CSW_MAX_ALLOCATION);
        assert_eq!(super::super::bcode_id(&h, b), id);
        // The entry prototype exists, is a cont, and has the right size.
        let proto = Ptr::from_word(trie_find(&h, h.root_ptr(RootId::Globals), id));
        assert_eq!(h.type_of(proto), CellType::Cont);
        assert_eq!(cont_size_words(&h, proto), 5);
    }

    #[test]
    fn test_duplicate_entry_point_is_rejected() {
        let mut h = test_heap();
        let mut vm = Vm::new();
        let code = vec![op(Insn::Return)];
        load_bcode(
            &mut h, &mut vm, "dup", WordType::Void, false, true, &[], 0, &code,
        )
        .unwrap();
        let err = load_bcode(
            &mut h, &mut vm, "dup", WordType::Void, false, true, &[], 0, &code,
        )
        .unwrap_err();
        assert!(err.to_string().contains("already declared"));
    }

    #[test]
    fn test_stream_validation_catches_garbage() {
        let mut h = test_heap();
        let mut vm = Vm::new();
        // Unknown opcode.
        let err = load_bcode(
            &mut h,
            &mut vm,
            "bad1",
            WordType::Void,
            false,
            false,
            &[],
            0,
            &[0xFFFF_FFFE],
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown opcode"));
        // Truncated immediate.
        let err = load_bcode(
            &mut h,
            &mut vm,
            "bad2",
            WordType::Void,
            false,
            false,
            &[],
            0,
            &[op(Insn::Pick)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("truncated"));
        // Backward branch.
        let err = load_bcode(
            &mut h,
            &mut vm,
            "bad3",
            WordType::Void,
            false,
            false,
            &[],
            0,
            &[op(Insn::Push), op(Insn::Branch), 0, op(Insn::Return)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("backward branch"));
        // Branch into the middle of an instruction.
        let err = load_bcode(
            &mut h,
            &mut vm,
            "bad4",
            WordType::Void,
            false,
            false,
            &[],
            0,
            &[op(Insn::Branch), 3, op(Insn::Pick), 0],
        )
        .unwrap_err();
        assert!(err.to_string().contains("not an instruction boundary"));
    }

    #[test]
    fn test_stack_too_deep_is_rejected() {
        let mut h = test_heap();
        let mut vm = Vm::new();
        let err = load_bcode(
            &mut h,
            &mut vm,
            "deep",
            WordType::Void,
            false,
            false,
            &[],
            MAX_NUMBER_OF_WORDS_IN_CONT,
            &[op(Insn::Return)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("stack too deep"));
    }

    #[test]
    fn test_max_allocation_sums_instructions() {
        let mut h = test_heap();
        let mut vm = Vm::new();
        let code = vec![
            op(Insn::Push),
            op(Insn::TupleMake),
            3,
            op(Insn::Cons),
            op(Insn::Return),
        ];
        let id = load_bcode(
            &mut h, &mut vm, "alloc", WordType::Tagged, false, false, &[], 4, &code,
        )
        .unwrap();
        let b = Ptr::from_word(trie_find(&h, h.root_ptr(RootId::Bcodes), id));
        assert_eq!(
            bcode_max_alloc(&h, b),
            4 + insn::CONS_MAX_ALLOCATION + CSW_MAX_ALLOCATION
        );
    }

    #[test]
    fn test_call_resolution_and_specialization() {
        let mut h = test_heap();
        let mut vm = Vm::new();
        // A leaf entry point the caller can resolve against.
        let leaf = vec![op(Insn::Return)];
        let leaf_id = load_bcode(
            &mut h, &mut vm, "leaf", WordType::Tagged, false, true, &[], 1, &leaf,
        )
        .unwrap();
        let after = vec![op(Insn::Return)];
        let after_id = load_bcode(
            &mut h, &mut vm, "after", WordType::Tagged, false, false, &[], 1, &after,
        )
        .unwrap();

        let caller = vec![
            op(Insn::CallGlobal),
            leaf_id,
            1,
            after_id,
            op(Insn::Return),
        ];
        let caller_id = load_bcode(
            &mut h, &mut vm, "caller", WordType::Tagged, false, false, &[], 1, &caller,
        )
        .unwrap();
        assert!(vm.pending_bcodes.is_empty(), "resolution did not finish");
        let b = Ptr::from_word(trie_find(&h, h.root_ptr(RootId::Bcodes), caller_id));
        // Arity 1 resolves to the 0/1-specialized pointer form.
        assert_eq!(h.word_at(b, 7), Insn::CallGlobalPtr01.opcode());
        let proto = trie_find(&h, h.root_ptr(RootId::Globals), leaf_id);
        assert_eq!(h.word_at(b, 8), proto);
        let next = trie_find(&h, h.root_ptr(RootId::Bcodes), after_id);
        assert_eq!(h.word_at(b, 10), next);
    }

    #[test]
    fn test_unresolvable_call_stays_generic_and_pending() {
        let mut h = test_heap();
        let mut vm = Vm::new();
        let caller = vec![
            op(Insn::CallGlobal),
            9999, // no such global yet
            2,
            9999,
            op(Insn::Return),
        ];
        let id = load_bcode(
            &mut h,
            &mut vm,
            "caller-of-nothing",
            WordType::Tagged,
            false,
            false,
            &[WordType::Tagged],
            2,
            &caller,
        )
        .unwrap();
        assert_eq!(vm.pending_bcodes, vec![id]);
        let b = Ptr::from_word(trie_find(&h, h.root_ptr(RootId::Bcodes), id));
        assert_eq!(h.word_at(b, 7), Insn::CallGlobal.opcode());
    }
}
