//! Interpreter - The Dispatch Loop and the Cooperative Scheduler
//!
//! Execution is organised around byte code sequences. A "jiffy" is one
//! sequence's worth of work; after `jiffies_between_yields` jiffies the
//! running thread is packaged into a `context` cell and the scheduler
//! picks the head of the highest-priority non-empty queue. Priority 0 is
//! reserved for work that should only run when the database is otherwise
//! idle.
//!
//! A sequence is entered only when the first generation can hold its
//! declared maximum allocation; otherwise the machine commits first and
//! restarts the sequence, protecting its registers in the `suspended_*`
//! roots across the commit. Instructions whose true demand exceeds the
//! declaration (runtime-sized strings) raise flush-and-retry, which does
//! the same. A network instruction that cannot progress parks the thread
//! in `blocked_threads` keyed by thread id until the poll loop reports a
//! wakeup.

use crate::cell::{CellType, WordType};
use crate::error::Result;
use crate::heap::Heap;
use crate::queue::{
    queue_get_first, queue_insert_last, queue_is_empty, queue_remove_first, QUEUE_MAX_ALLOCATION,
};
use crate::root::{RootId, NUMBER_OF_CONTEXT_PRIORITIES};
use crate::shtring::{
    shtring_cat, shtring_cat_max_allocation, shtring_cmp, shtring_create,
    shtring_create_max_allocation, shtring_length, shtring_to_bytes,
};
use crate::trie::{trie_delete, trie_find, trie_insert, TRIE_MAX_ALLOCATION};
use crate::word::{
    bool_to_tagged, signed_to_tagged, tagged_is_false, tagged_is_int, tagged_is_ptr,
    tagged_to_signed, Ptr, Word, NULL_PTR,
};

use super::insn::{self, Insn, CONTEXT_MAX_ALLOCATION, CSW_MAX_ALLOCATION};
use super::net::NetOutcome;
use super::{
    bcode_accu_type, bcode_code_len, bcode_cont_words, bcode_is_reusable, bcode_max_alloc,
    bcode_stack_depth, cont_bcode, cont_bound_args, cont_next, cont_size_words, Vm,
};

/// Where a finished sequence sends the machine.
enum Flow {
    /// Run the (possibly new) current continuation.
    Run,
    /// The thread is done.
    Die,
    /// Park the thread in `blocked_threads` and schedule another.
    Block,
    /// Commit, then restart this sequence from its first instruction.
    FlushRetry,
}

/// Scheduler states of the outer machine.
enum State {
    RunCont,
    Yield,
    Die,
    Block,
}

struct Regs {
    cont: Ptr,
    accu: Word,
    thread_id: Word,
    priority: Word,
}

/// Start executing `cont` with `accu` as its argument at `priority`.
/// With a null `cont`, resume whatever the `suspended_*` roots hold
/// (the recovery path) or just serve the runnable queues.
///
/// Returns the final accumulator once no runnable or blocked threads
/// remain.
pub fn interp(heap: &mut Heap, vm: &mut Vm, cont: Ptr, accu: Word, priority: Word) -> Result<Word> {
    assert!((priority as usize) < NUMBER_OF_CONTEXT_PRIORITIES);
    let jiffies_between_yields = heap.params().jiffies_between_yields as i64;
    let idle_timeout =
        std::time::Duration::from_micros(heap.params().usecs_for_network_select_when_idle as u64);
    let mut jiffies_until_yield = jiffies_between_yields;
    let mut is_idle = false;

    vm.caches.flush();

    let mut r = Regs {
        cont,
        accu,
        thread_id: 0,
        priority,
    };
    let mut state = if r.cont.is_null() {
        // The recovery entry: pick up a commit-suspended thread if the
        // root block carries one.
        if restore_registers(heap, &mut r) {
            State::RunCont
        } else {
            State::Die
        }
    } else {
        State::RunCont
    };

    loop {
        match state {
            State::RunCont => {
                // Make sure this sequence's declared maximum allocation
                // fits the batch, and that the frame we run is a private
                // first-generation copy.
                let mut bcode = cont_bcode(heap, r.cont);
                debug_assert_eq!(heap.type_of(bcode), CellType::Bcode);
                if !heap.is_in_first_generation(r.cont)
                    || bcode_is_reusable(heap, bcode)
                    || !heap.can_allocate(bcode_max_alloc(heap, bcode))
                {
                    let mut dead = false;
                    while !heap.can_allocate(
                        bcode_cont_words(heap, bcode) + bcode_max_alloc(heap, bcode),
                    ) {
                        snapshot_registers(heap, &r);
                        heap.flush_batch()?;
                        vm.after_commit(heap);
                        if !restore_registers(heap, &mut r) {
                            dead = true;
                            break;
                        }
                        bcode = cont_bcode(heap, r.cont);
                    }
                    if dead {
                        state = State::Die;
                        continue;
                    }
                    r.cont = heap.cell_copy(r.cont);
                }

                heap.stats.sequences_executed += 1;
                log::trace!(
                    "running thread {} bcode {}",
                    r.thread_id,
                    super::bcode_id(heap, cont_bcode(heap, r.cont))
                );
                match execute_sequence(heap, vm, &mut r)? {
                    Flow::Run => {
                        if jiffies_until_yield <= 0 {
                            jiffies_until_yield = jiffies_between_yields;
                            state = State::Yield;
                        } else {
                            jiffies_until_yield -= 1;
                        }
                    }
                    Flow::Die => state = State::Die,
                    Flow::Block => state = State::Block,
                    Flow::FlushRetry => {
                        jiffies_until_yield -= 1;
                        heap.stats.flush_retries += 1;
                        snapshot_registers(heap, &r);
                        heap.flush_batch()?;
                        vm.after_commit(heap);
                        if !restore_registers(heap, &mut r) {
                            state = State::Die;
                        }
                    }
                }
            }

            State::Yield => {
                // Package the running thread and put it at the back of
                // its queue. The allocation is part of the sequence's
                // context-switch allowance.
                assert!(heap.can_allocate(CSW_MAX_ALLOCATION));
                let ctx = make_context(heap, &r);
                enqueue_context(heap, ctx, r.priority as usize);
                heap.stats.context_switches += 1;
                state = State::Die;
            }

            State::Block => {
                // Park the thread under its thread id; a network wakeup
                // brings it back.
                assert!(heap.can_allocate(CONTEXT_MAX_ALLOCATION + TRIE_MAX_ALLOCATION));
                log::trace!("thread {} blocked", r.thread_id);
                let ctx = make_context(heap, &r);
                let blocked = heap.root_ptr(RootId::BlockedThreads);
                let blocked = trie_insert(heap, blocked, r.thread_id, ctx.to_word());
                heap.set_root_ptr(RootId::BlockedThreads, blocked);
                heap.stats.threads_blocked += 1;
                state = State::Die;
            }

            State::Die => {
                // Wake up blocked threads. If we commit while processing
                // wakeups, redo the loop: the commit's latency may have
                // let more events arrive.
                let timeout = if is_idle { Some(idle_timeout) } else { None };
                is_idle = false;
                let mut wakeups_left = vm.net.number_of_wakeups(timeout);
                let mut flushed = false;
                while wakeups_left > 0 {
                    wakeups_left -= 1;
                    while !heap
                        .can_allocate(TRIE_MAX_ALLOCATION + 2 * QUEUE_MAX_ALLOCATION)
                    {
                        heap.flush_batch()?;
                        vm.after_commit(heap);
                        flushed = true;
                    }
                    let Some(wake) = vm.net.get_wakeup() else {
                        break;
                    };
                    log::trace!("waking thread {}", wake.thread_id);
                    let blocked = heap.root_ptr(RootId::BlockedThreads);
                    let ctx = Ptr::from_word(trie_find(heap, blocked, wake.thread_id));
                    assert!(!ctx.is_null(), "wakeup for a thread that is not blocked");
                    debug_assert_eq!(heap.word_at(ctx, 3), wake.thread_id);
                    let pri = heap.word_at(ctx, 4) as usize;
                    assert!(pri < NUMBER_OF_CONTEXT_PRIORITIES);
                    enqueue_context(heap, ctx, pri);
                    let blocked = trie_delete(heap, blocked, wake.thread_id);
                    heap.set_root_ptr(RootId::BlockedThreads, blocked);
                    heap.stats.wakeups_delivered += 1;
                }
                if flushed {
                    continue;
                }

                // Pick the highest-priority runnable thread.
                let mut picked = false;
                let mut pri = NUMBER_OF_CONTEXT_PRIORITIES;
                while pri > 0 {
                    pri -= 1;
                    if pri == 0 {
                        // Reaching the lowest priority means the server
                        // is idle; that is when preventive collection
                        // and the poll timeout are allowed.
                        is_idle = true;
                    }
                    let q = heap.root_ptr_vec(RootId::Contexts, pri);
                    if queue_is_empty(q) {
                        continue;
                    }
                    while !heap.can_allocate(QUEUE_MAX_ALLOCATION) {
                        heap.flush_batch()?;
                        vm.after_commit(heap);
                    }
                    let q = heap.root_ptr_vec(RootId::Contexts, pri);
                    let ctx = Ptr::from_word(queue_get_first(heap, q));
                    let q = queue_remove_first(heap, q);
                    heap.set_root_ptr_vec(RootId::Contexts, pri, q);
                    r.cont = Ptr::from_word(heap.word_at(ctx, 1));
                    r.accu = heap.word_at(ctx, 2);
                    r.thread_id = heap.word_at(ctx, 3);
                    r.priority = heap.word_at(ctx, 4);
                    debug_assert_eq!(r.priority as usize, pri);
                    picked = true;
                    break;
                }
                if picked {
                    state = State::RunCont;
                    continue;
                }

                if !heap.root_ptr(RootId::BlockedThreads).is_null() {
                    // Only blocked threads remain: give the idle-driven
                    // collector its chance, then keep polling.
                    if heap.maybe_idle_collect()? {
                        vm.after_commit(heap);
                    }
                    continue;
                }

                // No threads at all. In a server this hardly ever
                // happens, but tests and batch runs end here.
                return Ok(r.accu);
            }
        }
    }
}

/// Protect the machine registers in the root block before a commit.
fn snapshot_registers(heap: &mut Heap, r: &Regs) {
    let bcode = cont_bcode(heap, r.cont);
    heap.set_root_ptr(RootId::SuspendedCont, r.cont);
    heap.set_root_word(RootId::SuspendedAccuType, bcode_accu_type(heap, bcode));
    heap.set_root_word(RootId::SuspendedAccu, r.accu);
    heap.set_root_word(RootId::SuspendedThreadId, r.thread_id);
    heap.set_root_word(RootId::SuspendedPriority, r.priority);
}

/// Reload the machine registers from the root block. Returns false when
/// no suspended continuation is present.
fn restore_registers(heap: &mut Heap, r: &mut Regs) -> bool {
    let cont = heap.root_ptr(RootId::SuspendedCont);
    if cont.is_null() {
        return false;
    }
    // Drop the root's reference so the frame can be collected once it
    // finishes.
    heap.set_root_ptr(RootId::SuspendedCont, NULL_PTR);
    r.cont = cont;
    r.accu = heap.root_word(RootId::SuspendedAccu);
    heap.set_root_word(RootId::SuspendedAccuType, WordType::Void as Word);
    r.thread_id = heap.root_word(RootId::SuspendedThreadId);
    r.priority = heap.root_word(RootId::SuspendedPriority);
    true
}

fn make_context(heap: &mut Heap, r: &Regs) -> Ptr {
    let bcode = cont_bcode(heap, r.cont);
    let accu_type = bcode_accu_type(heap, bcode);
    let ctx = heap.allocate(CONTEXT_MAX_ALLOCATION, CellType::Context);
    let header = heap.word(ctx);
    heap.set_word(ctx, header | accu_type);
    heap.set_word_at(ctx, 1, r.cont.to_word());
    heap.set_word_at(ctx, 2, r.accu);
    heap.set_word_at(ctx, 3, r.thread_id);
    heap.set_word_at(ctx, 4, r.priority);
    ctx
}

fn enqueue_context(heap: &mut Heap, ctx: Ptr, pri: usize) {
    let q = heap.root_ptr_vec(RootId::Contexts, pri);
    let q = queue_insert_last(heap, q, ctx.to_word());
    heap.set_root_ptr_vec(RootId::Contexts, pri, q);
}

fn make_list_cell(heap: &mut Heap, car: Word, cdr: Word) -> Word {
    let p = heap.allocate(3, CellType::List);
    heap.set_word_at(p, 1, car);
    heap.set_word_at(p, 2, cdr);
    p.to_word()
}

/// Build the callee frame of a call: a raw copy of the prototype with
/// the executing-depth marker, the prototype's bcode, the given return
/// link, and the prototype's bound arguments.
fn build_call_cont(heap: &mut Heap, proto: Ptr, ret_link: Word) -> Ptr {
    let size = cont_size_words(heap, proto);
    let bound = cont_bound_args(heap, proto);
    debug_assert!(bound != 0xFFF, "calling an executing frame");
    let new_cont = heap.raw_allocate(size);
    heap.set_word(new_cont, heap.word(proto) | 0xFFF);
    let b = heap.word_at(proto, 1);
    heap.set_word_at(new_cont, 1, b);
    heap.set_word_at(new_cont, 2, ret_link);
    for i in 0..bound {
        let w = heap.word_at(proto, 3 + i);
        heap.set_word_at(new_cont, 3 + i, w);
    }
    new_cont
}

/// Execute one byte code sequence to its control transfer.
///
/// `r.cont` is a private first-generation frame and the first
/// generation holds the sequence's declared maximum allocation.
#[allow(clippy::too_many_lines)]
fn execute_sequence(heap: &mut Heap, vm: &mut Vm, r: &mut Regs) -> Result<Flow> {
    let cont = r.cont;
    let bcode = cont_bcode(heap, cont);
    let code_len = bcode_code_len(heap, bcode);
    let mut pc: usize = 0;
    let mut sp: usize = bcode_stack_depth(heap, bcode);
    let mut accu = r.accu;

    macro_rules! imm {
        ($k:expr) => {
            heap.word_at(bcode, 7 + pc + $k)
        };
    }
    macro_rules! st {
        ($i:expr) => {
            heap.word_at(cont, 3 + $i)
        };
    }
    macro_rules! push {
        ($v:expr) => {{
            let v = $v;
            heap.set_word_at(cont, 3 + sp, v);
            sp += 1;
        }};
    }
    macro_rules! pop {
        () => {{
            sp -= 1;
            heap.word_at(cont, 3 + sp)
        }};
    }
    macro_rules! finish {
        ($f:expr) => {{
            r.accu = accu;
            return Ok($f);
        }};
    }
    macro_rules! cmp_branch {
        ($op:tt) => {{
            let x = pop!();
            if x $op accu {
                pc = imm!(0) as usize;
            } else {
                pc += 2;
            }
        }};
    }
    macro_rules! cmp_accu {
        ($op:tt) => {{
            let x = pop!();
            accu = bool_to_tagged(x $op accu);
            pc += 1;
        }};
    }

    loop {
        assert!(pc < code_len, "program counter ran off the sequence");
        heap.stats.insns_executed += 1;
        let opw = heap.word_at(bcode, 7 + pc);
        let Some((op, fused)) = insn::decode(opw) else {
            panic!("undecodable opcode {opw:#x} at pc {pc}");
        };
        if fused {
            push!(accu);
        }
        match op {
            // === Stack manipulation and value loading ===
            Insn::Push => {
                push!(accu);
                pc += 1;
            }
            Insn::Drop => {
                sp -= 1;
                pc += 1;
            }
            Insn::DropN => {
                sp -= imm!(0) as usize;
                pc += 2;
            }
            Insn::Pick => {
                accu = st!(imm!(0) as usize);
                pc += 2;
            }
            Insn::Pop => {
                accu = pop!();
                pc += 1;
            }
            Insn::Dup => {
                let v = st!(sp - 1);
                push!(v);
                pc += 1;
            }
            Insn::Swap => {
                let a = st!(sp - 1);
                let b = st!(sp - 2);
                heap.set_word_at(cont, 3 + sp - 1, b);
                heap.set_word_at(cont, 3 + sp - 2, a);
                pc += 1;
            }
            Insn::Exch => {
                let t = st!(sp - 1);
                heap.set_word_at(cont, 3 + sp - 1, accu);
                accu = t;
                pc += 1;
            }
            Insn::LoadImm | Insn::TLoadImm | Insn::LoadImmString => {
                accu = imm!(0);
                pc += 2;
            }
            Insn::LoadNull => {
                accu = 0;
                pc += 1;
            }
            Insn::GetRootPtr => {
                accu = heap
                    .root_slot_word(imm!(0) as usize)
                    .expect("root index out of range");
                pc += 2;
            }
            Insn::SetRootPtr => {
                let ok = heap.set_root_slot_word(imm!(0) as usize, accu);
                assert!(ok, "root index out of range");
                pc += 2;
            }

            // === Tagged arithmetic ===
            Insn::TAdd => {
                debug_assert!(tagged_is_int(accu));
                let x = pop!();
                debug_assert!(tagged_is_int(x));
                // Tag bits 01 + 01 sum to 10; one decrement restores them.
                accu = accu.wrapping_add(x).wrapping_sub(1);
                pc += 1;
            }
            Insn::TSub => {
                let x = pop!();
                accu = x.wrapping_sub(accu).wrapping_add(1);
                pc += 1;
            }
            Insn::TNeg => {
                accu = signed_to_tagged(tagged_to_signed(accu).wrapping_neg());
                pc += 1;
            }
            Insn::TMul => {
                let x = pop!();
                accu = signed_to_tagged(
                    tagged_to_signed(x).wrapping_mul(tagged_to_signed(accu)),
                );
                pc += 1;
            }
            Insn::TDiv => {
                let x = pop!();
                let d = tagged_to_signed(accu);
                assert!(d != 0, "tagged division by zero");
                accu = signed_to_tagged(tagged_to_signed(x) / d);
                pc += 1;
            }
            Insn::TMod => {
                let x = pop!();
                let d = tagged_to_signed(accu);
                assert!(d != 0, "tagged modulo by zero");
                accu = signed_to_tagged(tagged_to_signed(x) % d);
                pc += 1;
            }
            Insn::TAddImm => {
                accu = accu.wrapping_add(imm!(0));
                pc += 2;
            }
            Insn::TSubImm => {
                accu = accu.wrapping_sub(imm!(0));
                pc += 2;
            }
            Insn::TMulImm => {
                accu = signed_to_tagged(
                    tagged_to_signed(accu).wrapping_mul(imm!(0) as i32),
                );
                pc += 2;
            }
            Insn::TCmpEq => cmp_accu!(==),
            Insn::TCmpNe => cmp_accu!(!=),
            Insn::TCmpLt => cmp_accu!(<),
            Insn::TCmpLe => cmp_accu!(<=),
            Insn::TCmpGt => cmp_accu!(>),
            Insn::TCmpGe => cmp_accu!(>=),
            Insn::TNot => {
                accu = bool_to_tagged(tagged_is_false(accu));
                pc += 1;
            }

            // === Raw word arithmetic ===
            Insn::Add => {
                let x = pop!();
                accu = accu.wrapping_add(x);
                pc += 1;
            }
            Insn::Sub => {
                let x = pop!();
                accu = x.wrapping_sub(accu);
                pc += 1;
            }
            Insn::Mul => {
                let x = pop!();
                accu = accu.wrapping_mul(x);
                pc += 1;
            }
            Insn::Div => {
                let x = pop!();
                assert!(accu != 0, "division by zero");
                accu = x / accu;
                pc += 1;
            }
            Insn::Mod => {
                let x = pop!();
                assert!(accu != 0, "modulo by zero");
                accu = x % accu;
                pc += 1;
            }
            Insn::AddImm => {
                accu = accu.wrapping_add(imm!(0));
                pc += 2;
            }
            Insn::SubImm => {
                accu = accu.wrapping_sub(imm!(0));
                pc += 2;
            }
            Insn::LshiftImm => {
                accu <<= imm!(0);
                pc += 2;
            }
            Insn::RshiftImm => {
                accu >>= imm!(0);
                pc += 2;
            }

            // === Branches (forward only) ===
            Insn::Branch => {
                pc = imm!(0) as usize;
            }
            Insn::Beq => cmp_branch!(==),
            Insn::Bne => cmp_branch!(!=),
            Insn::Blt => cmp_branch!(<),
            Insn::Ble => cmp_branch!(<=),
            Insn::Bgt => cmp_branch!(>),
            Insn::Bge => cmp_branch!(>=),
            Insn::TBranchIfFalse => {
                if tagged_is_false(accu) {
                    pc = imm!(0) as usize;
                } else {
                    pc += 2;
                }
            }
            Insn::TBranchIfTrue => {
                if tagged_is_false(accu) {
                    pc += 2;
                } else {
                    pc = imm!(0) as usize;
                }
            }
            Insn::TBranchIfNotCons => {
                let is_cons = accu != 0
                    && tagged_is_ptr(accu)
                    && heap.type_of(Ptr::from_word(accu)) == CellType::List;
                if is_cons {
                    pc += 2;
                } else {
                    pc = imm!(0) as usize;
                }
            }
            Insn::TBranchIfNotNull => {
                if accu != 0 {
                    pc = imm!(0) as usize;
                } else {
                    pc += 2;
                }
            }
            Insn::TBranchIfNotNtuple => {
                let want = crate::cell::make_header(CellType::Tuple, imm!(0));
                let is_tuple = accu != 0
                    && tagged_is_ptr(accu)
                    && heap.word(Ptr::from_word(accu)) == want;
                if is_tuple {
                    pc += 3;
                } else {
                    pc = imm!(1) as usize;
                }
            }

            // === Lists, tuples, vectors ===
            Insn::Cons => {
                let x = pop!();
                accu = make_list_cell(heap, x, accu);
                pc += 1;
            }
            Insn::RCons => {
                let x = pop!();
                accu = make_list_cell(heap, accu, x);
                pc += 1;
            }
            Insn::Car => {
                accu = heap.word_at(Ptr::from_word(accu), 1);
                pc += 1;
            }
            Insn::Cdr => {
                accu = heap.word_at(Ptr::from_word(accu), 2);
                pc += 1;
            }
            Insn::TupleMake => {
                let n = imm!(0) as usize;
                assert!(n > 0);
                let t = heap.allocate(1 + n, CellType::Tuple);
                let header = heap.word(t);
                heap.set_word(t, header | n as Word);
                heap.set_word_at(t, n, accu);
                for i in (1..n).rev() {
                    let v = pop!();
                    heap.set_word_at(t, i, v);
                }
                accu = t.to_word();
                pc += 2;
            }
            Insn::TupleRef => {
                accu = heap.word_at(Ptr::from_word(accu), imm!(0) as usize + 1);
                pc += 2;
            }
            Insn::MakeWordVector => {
                let n = imm!(0) as usize;
                assert!(n > 0);
                let p = heap.allocate(n + 1, CellType::WordVector);
                let header = heap.word(p);
                heap.set_word(p, header | n as Word);
                sp -= n - 1;
                for i in 0..n - 1 {
                    let v = st!(sp + i);
                    heap.set_word_at(p, 1 + i, v);
                }
                heap.set_word_at(p, n, accu);
                accu = p.to_word();
                pc += 2;
            }

            // === Objects ===
            Insn::MakeNewProto => {
                let obj = heap.allocate(2, CellType::Object);
                let header = heap.word(obj);
                heap.set_word(obj, header | imm!(0));
                heap.set_word_at(obj, 1, 0);
                accu = obj.to_word();
                pc += 2;
            }
            Insn::GetObjField => {
                let fields = Ptr::from_word(heap.word_at(Ptr::from_word(accu), 1));
                accu = trie_find(heap, fields, imm!(0));
                pc += 2;
            }
            Insn::InsertObjField | Insn::RebindObjField => {
                let field_id = imm!(0);
                let old = Ptr::from_word(pop!());
                let fields = Ptr::from_word(heap.word_at(old, 1));
                let fields = trie_insert(heap, fields, field_id, accu);
                let new_obj = heap.raw_allocate(2);
                let header = heap.word(old);
                heap.set_word(new_obj, header);
                heap.set_word_at(new_obj, 1, fields.to_word());
                accu = new_obj.to_word();
                pc += 2;
            }
            Insn::GetObjMethod => {
                let class_id = heap.word(Ptr::from_word(accu)) & 0x00FF_FFFF;
                let traits = Ptr::from_word(vm.caches.global_get(heap, imm!(0)));
                let trait_trie = Ptr::from_word(trie_find(heap, traits, class_id));
                accu = trie_find(heap, trait_trie, imm!(1));
                pc += 3;
            }

            // === Globals ===
            Insn::GetGlobal => {
                accu = vm.caches.global_get(heap, imm!(0));
                assert!(accu != 0, "undefined global {}", imm!(0));
                pc += 2;
            }
            Insn::SetGlobal => {
                let id = imm!(0);
                vm.caches.global_set(heap, accu, id);
                pc += 2;
            }

            // === Tries from byte code ===
            Insn::TrieInsert => {
                sp -= 2;
                let root = Ptr::from_word(st!(sp));
                let key = st!(sp + 1);
                accu = trie_insert(heap, root, key, accu).to_word();
                pc += 1;
            }
            Insn::TrieFind => {
                let root = Ptr::from_word(pop!());
                accu = trie_find(heap, root, accu);
                pc += 1;
            }

            // === Strings ===
            Insn::StringAppend => {
                let s1 = Ptr::from_word(st!(sp - 1));
                let s2 = Ptr::from_word(accu);
                // The demand depends on the operands; this is the one
                // place a declared bound cannot cover.
                if !heap.can_allocate(shtring_cat_max_allocation(heap, s1, s2)) {
                    finish!(Flow::FlushRetry);
                }
                accu = shtring_cat(heap, s1, s2).to_word();
                sp -= 1;
                pc += 1;
            }
            Insn::IntToString => {
                let text = tagged_to_signed(accu).to_string();
                assert!(heap.can_allocate(shtring_create_max_allocation(text.len())));
                accu = shtring_create(heap, text.as_bytes()).to_word();
                pc += 1;
            }
            Insn::StringCmp => {
                let s1 = Ptr::from_word(pop!());
                let s2 = Ptr::from_word(accu);
                let ord = match shtring_cmp(heap, s1, s2) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                };
                accu = signed_to_tagged(ord);
                pc += 1;
            }
            Insn::StringLength => {
                accu = signed_to_tagged(shtring_length(heap, Ptr::from_word(accu)) as i32);
                pc += 1;
            }

            // === Calls ===
            Insn::Bind => {
                let n = imm!(0) as usize;
                let old = Ptr::from_word(accu);
                debug_assert_eq!(cont_bound_args(heap, old), 0, "a cont binds only once");
                let size = cont_size_words(heap, old);
                let new_cont = heap.raw_allocate(size);
                heap.set_word(new_cont, heap.word(old) + n as Word);
                let b = heap.word_at(old, 1);
                heap.set_word_at(new_cont, 1, b);
                let next = heap.word_at(old, 2);
                heap.set_word_at(new_cont, 2, next);
                sp -= n;
                for i in 0..n {
                    let v = st!(sp + i);
                    heap.set_word_at(new_cont, 3 + i, v);
                }
                accu = new_cont.to_word();
                pc += 2;
            }
            Insn::Call => {
                let nargs = imm!(0) as usize;
                let next_id = imm!(1);
                let proto = Ptr::from_word(accu);
                let bound = cont_bound_args(heap, proto);
                let new_cont = build_call_cont(heap, proto, cont.to_word());
                if nargs == 0 {
                    if bound != 0 {
                        accu = heap.word_at(new_cont, 3 + bound - 1);
                    }
                } else {
                    sp -= nargs;
                    for i in 0..nargs - 1 {
                        let v = st!(sp + i);
                        heap.set_word_at(new_cont, 3 + bound + i, v);
                    }
                    accu = st!(sp + nargs - 1);
                }
                let next = vm.caches.bcode_get(heap, next_id);
                assert!(!next.is_null(), "unknown continuation bcode {next_id}");
                heap.set_word_at(cont, 1, next.to_word());
                r.cont = new_cont;
                finish!(Flow::Run);
            }
            Insn::TailCall => {
                let nargs = imm!(0) as usize;
                let proto = Ptr::from_word(accu);
                let bound = cont_bound_args(heap, proto);
                let new_cont = build_call_cont(heap, proto, cont_next(heap, cont));
                if nargs == 0 {
                    if bound != 0 {
                        accu = heap.word_at(new_cont, 3 + bound - 1);
                    }
                } else {
                    sp -= nargs;
                    for i in 0..nargs - 1 {
                        let v = st!(sp + i);
                        heap.set_word_at(new_cont, 3 + bound + i, v);
                    }
                    accu = st!(sp + nargs - 1);
                }
                r.cont = new_cont;
                finish!(Flow::Run);
            }
            Insn::Return => {
                let next = cont_next(heap, cont);
                if next == 0 {
                    finish!(Flow::Die);
                }
                r.cont = Ptr::from_word(next);
                finish!(Flow::Run);
            }
            Insn::GotoBcode => {
                let b = vm.caches.bcode_get(heap, imm!(0));
                assert!(!b.is_null(), "unknown bcode {}", imm!(0));
                heap.set_word_at(cont, 1, b.to_word());
                finish!(Flow::Run);
            }
            Insn::GotoSelf => {
                finish!(Flow::Run);
            }

            Insn::CallGlobal
            | Insn::CallGlobal01
            | Insn::CallGlobal2
            | Insn::CallGlobal3
            | Insn::CallGlobal4
            | Insn::CallGlobalPtr
            | Insn::CallGlobalPtr01
            | Insn::CallGlobalPtr2
            | Insn::CallGlobalPtr3
            | Insn::CallGlobalPtr4 => {
                let resolved = matches!(
                    op,
                    Insn::CallGlobalPtr
                        | Insn::CallGlobalPtr01
                        | Insn::CallGlobalPtr2
                        | Insn::CallGlobalPtr3
                        | Insn::CallGlobalPtr4
                );
                let proto = if resolved {
                    Ptr::from_word(imm!(0))
                } else {
                    let p = Ptr::from_word(vm.caches.global_get(heap, imm!(0)));
                    assert!(!p.is_null(), "call of undefined global {}", imm!(0));
                    p
                };
                let nargs = imm!(1) as usize;
                let new_cont = build_call_cont(heap, proto, cont.to_word());
                if nargs > 1 {
                    sp -= nargs - 1;
                    for i in 0..nargs - 1 {
                        let v = st!(sp + i);
                        heap.set_word_at(new_cont, 3 + i, v);
                    }
                }
                let next = if resolved {
                    Ptr::from_word(imm!(2))
                } else {
                    let b = vm.caches.bcode_get(heap, imm!(2));
                    assert!(!b.is_null(), "unknown continuation bcode {}", imm!(2));
                    b
                };
                heap.set_word_at(cont, 1, next.to_word());
                r.cont = new_cont;
                finish!(Flow::Run);
            }

            Insn::TailCallGlobal
            | Insn::TailCallGlobal01
            | Insn::TailCallGlobal2
            | Insn::TailCallGlobal3
            | Insn::TailCallGlobal4
            | Insn::TailCallGlobalPtr
            | Insn::TailCallGlobalPtr01
            | Insn::TailCallGlobalPtr2
            | Insn::TailCallGlobalPtr3
            | Insn::TailCallGlobalPtr4 => {
                let resolved = matches!(
                    op,
                    Insn::TailCallGlobalPtr
                        | Insn::TailCallGlobalPtr01
                        | Insn::TailCallGlobalPtr2
                        | Insn::TailCallGlobalPtr3
                        | Insn::TailCallGlobalPtr4
                );
                let proto = if resolved {
                    Ptr::from_word(imm!(0))
                } else {
                    let p = Ptr::from_word(vm.caches.global_get(heap, imm!(0)));
                    assert!(!p.is_null(), "tail call of undefined global {}", imm!(0));
                    p
                };
                let nargs = imm!(1) as usize;
                let new_cont = build_call_cont(heap, proto, cont_next(heap, cont));
                if nargs > 1 {
                    sp -= nargs - 1;
                    for i in 0..nargs - 1 {
                        let v = st!(sp + i);
                        heap.set_word_at(new_cont, 3 + i, v);
                    }
                }
                r.cont = new_cont;
                finish!(Flow::Run);
            }

            // === Threads ===
            Insn::Spawn => {
                let to_id = imm!(0);
                let nargs = imm!(1) as usize;
                let pri = imm!(2);
                assert!((pri as usize) < NUMBER_OF_CONTEXT_PRIORITIES);
                let proto = Ptr::from_word(vm.caches.global_get(heap, to_id));
                assert!(!proto.is_null(), "spawn of undefined global {to_id}");
                let new_cont = build_call_cont(heap, proto, 0);
                if nargs > 1 {
                    sp -= nargs - 1;
                    for i in 0..nargs - 1 {
                        let v = st!(sp + i);
                        heap.set_word_at(new_cont, 3 + i, v);
                    }
                }
                let tid = heap.root_word(RootId::HighestThreadId) + 1;
                heap.set_root_word(RootId::HighestThreadId, tid);
                let spawned = Regs {
                    cont: new_cont,
                    accu,
                    thread_id: tid,
                    priority: pri,
                };
                let ctx = make_context(heap, &spawned);
                enqueue_context(heap, ctx, pri as usize);
                log::trace!("spawned thread {tid} at priority {pri}");
                pc += 4;
            }
            Insn::Die | Insn::Exit => {
                finish!(Flow::Die);
            }

            // === Network I/O ===
            Insn::NetListen => {
                match vm.net.listen((accu & 0xFFFF) as u16) {
                    Ok(handle) => {
                        push!(0);
                        accu = handle;
                        pc += 2;
                    }
                    Err(e) => {
                        push!(e);
                        accu = 0;
                        pc = imm!(0) as usize;
                    }
                }
            }
            Insn::NetAccept => {
                match vm.net.accept(r.thread_id, accu) {
                    NetOutcome::Blocked => finish!(Flow::Block),
                    NetOutcome::Ok(handle) => {
                        push!(0);
                        accu = handle;
                        pc += 2;
                    }
                    NetOutcome::Fatal(e) => {
                        push!(e);
                        pc = imm!(0) as usize;
                    }
                }
            }
            Insn::NetReadChar => {
                match vm.net.read_char(r.thread_id, accu) {
                    NetOutcome::Blocked => finish!(Flow::Block),
                    NetOutcome::Ok(c) => {
                        push!(0);
                        accu = c as Word;
                        pc += 2;
                    }
                    NetOutcome::Fatal(e) => {
                        push!(e);
                        pc = imm!(0) as usize;
                    }
                }
            }
            Insn::NetWriteChar => {
                let c = (st!(sp - 1) & 0xFF) as u8;
                match vm.net.write_char(r.thread_id, accu, c) {
                    NetOutcome::Blocked => finish!(Flow::Block),
                    NetOutcome::Ok(()) => {
                        sp -= 1;
                        accu = 0;
                        pc += 2;
                    }
                    NetOutcome::Fatal(e) => {
                        sp -= 1;
                        accu = e;
                        pc = imm!(0) as usize;
                    }
                }
            }
            Insn::NetClose => {
                vm.net.close(accu);
                pc += 1;
            }

            // === Printing ===
            Insn::TPrint => {
                if !heap.params().print_insns_are_disabled {
                    if tagged_is_int(accu) {
                        println!("{}", tagged_to_signed(accu));
                    } else if accu != 0 && tagged_is_ptr(accu) {
                        let p = Ptr::from_word(accu);
                        if heap.type_of(p) == CellType::Shtring {
                            println!("{}", String::from_utf8_lossy(&shtring_to_bytes(heap, p)));
                        } else {
                            println!("{}", heap.fmt_cell(p));
                        }
                    } else {
                        println!("{accu:#x}");
                    }
                }
                pc += 1;
            }
            Insn::PrintInt => {
                if !heap.params().print_insns_are_disabled {
                    println!("{accu}");
                }
                pc += 1;
            }
        }
    }
}
