//! Block-size-invariance detection.
//!
//! Tracks, for every SSA value, which of the kernel's launch parameters its
//! value symbolically depends on: `Const` (none — a literal or something
//! derived purely from constants), `Tid`/`Bid`/`Bsize`/`Gsize` (thread index,
//! block index, block dimension, grid dimension respectively), `BidBsize` (a
//! combination of block index and block dimension — the common `blockIdx *
//! blockDim` address-computation idiom), `BConst`/`BBsize` (boolean results:
//! a block-size-invariant predicate, and one that depends on the block
//! dimension), or `Top` (anything else). A store through a pointer that
//! depends on the block dimension, or that stores a block-size-dependent
//! value, makes the kernel's behavior sensitive to the launch configuration
//! it's invoked with — changing the block size could read or write a
//! different set of addresses.

use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt::{Display, Formatter, Result as FmtResult};

use derive_more::Display as DisplayDerive;

use crate::commons::Valid;
use crate::engine::{forward_analysis, Analysis, InstPoint};
use crate::ir::{
    AddrSpace, AllocKind, BbId, Callee, Cfg, Dim, Function, FuncId, Instruction, Operand, Program,
    SpecialRegister, Terminal, Type, ValueId,
};
use crate::lattice::{AbstractState, AbstractValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, DisplayDerive)]
pub enum Tag {
    #[display(fmt = "_|_")]
    Bot,
    #[display(fmt = "const")]
    Const,
    #[display(fmt = "tid")]
    Tid,
    #[display(fmt = "bid")]
    Bid,
    #[display(fmt = "bsize")]
    Bsize,
    #[display(fmt = "gsize")]
    Gsize,
    #[display(fmt = "bid*bsize")]
    BidBsize,
    #[display(fmt = "bconst")]
    BConst,
    #[display(fmt = "bbsize")]
    BBsize,
    #[display(fmt = "u")]
    Top,
}

/// The per-analysis summary of a call's arguments, keyed by callee and
/// parameter index.
pub type ArgumentSummaries = Map<(FuncId, usize), BSizeDependence>;

/// The per-function join of every value returned along every path.
pub type ReturnSummaries = Map<FuncId, BSizeDependence>;

/// Per-function "is this function (and everything it calls) block-size
/// independent" verdict — true iff both its own flagged-access set and its
/// `__syncthreads` set are empty. Populated by the driver in callees-before-
/// callers order and consulted by callers analyzing a direct call.
pub type Verdicts = Map<FuncId, bool>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BSizeDependence {
    pub tag: Tag,
    pub is_address: bool,
    /// Mirrors the original analysis's `isConstant_` field: set at
    /// construction, never read back by any transfer function.
    pub is_constant: bool,
}

impl BSizeDependence {
    fn from_tag(tag: Tag) -> Self {
        BSizeDependence {
            is_constant: tag == Tag::Const,
            tag,
            is_address: false,
        }
    }

    pub fn bot() -> Self {
        BSizeDependence::from_tag(Tag::Bot)
    }
    pub fn constant(_n: Option<i64>) -> Self {
        BSizeDependence::from_tag(Tag::Const)
    }
    pub fn tid() -> Self {
        BSizeDependence::from_tag(Tag::Tid)
    }
    pub fn bid() -> Self {
        BSizeDependence::from_tag(Tag::Bid)
    }
    pub fn bsize() -> Self {
        BSizeDependence::from_tag(Tag::Bsize)
    }
    pub fn gsize() -> Self {
        BSizeDependence::from_tag(Tag::Gsize)
    }
    pub fn bid_bsize() -> Self {
        BSizeDependence::from_tag(Tag::BidBsize)
    }
    pub fn bconst() -> Self {
        BSizeDependence::from_tag(Tag::BConst)
    }
    pub fn bbsize() -> Self {
        BSizeDependence::from_tag(Tag::BBsize)
    }
    pub fn top() -> Self {
        BSizeDependence::from_tag(Tag::Top)
    }

    fn as_address(self, is_address: bool) -> Self {
        BSizeDependence { is_address, ..self }
    }
}

impl Display for BSizeDependence {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if self.is_address {
            write!(f, "*")?;
        }
        write!(f, "{}", self.tag)
    }
}

impl AbstractValue for BSizeDependence {
    const BOTTOM: Self = BSizeDependence {
        tag: Tag::Bot,
        is_address: false,
        is_constant: false,
    };

    fn join(&self, other: &Self) -> Self {
        match (self.tag, other.tag) {
            (Tag::Bot, _) => *other,
            (_, Tag::Bot) => *self,
            (a, b) if a == b => BSizeDependence::from_tag(a),
            _ => BSizeDependence::top(),
        }
    }
}

fn is_const_like(v: BSizeDependence) -> bool {
    matches!(v.tag, Tag::Const | Tag::BConst)
}

fn is_boolean_like(v: BSizeDependence) -> bool {
    matches!(v.tag, Tag::BConst | Tag::BBsize)
}

/// `v1 + v2`: adding a constant offset never changes the dependence class
/// of the other operand; two values of the same class stay in that class;
/// `tid + bid*bsize` collapses to `Const` (the coalesced base-plus-offset
/// pattern is thread-invariant modulo the warp); anything else collapses to
/// `Top`.
fn abstract_sum(a: BSizeDependence, b: BSizeDependence) -> BSizeDependence {
    if a.tag == Tag::Bot || b.tag == Tag::Bot {
        BSizeDependence::bot()
    } else if a.tag == Tag::Const {
        BSizeDependence::from_tag(b.tag)
    } else if b.tag == Tag::Const {
        BSizeDependence::from_tag(a.tag)
    } else if a.tag == b.tag {
        BSizeDependence::from_tag(a.tag)
    } else if (a.tag == Tag::Tid && b.tag == Tag::BidBsize)
        || (a.tag == Tag::BidBsize && b.tag == Tag::Tid)
    {
        BSizeDependence::constant(None)
    } else if (a.tag == Tag::Bid && b.tag == Tag::Bsize) || (a.tag == Tag::Bsize && b.tag == Tag::Bid)
    {
        BSizeDependence::bid_bsize()
    } else {
        BSizeDependence::top()
    }
}

/// `v1 * v2`: scaling by a constant doesn't change the other operand's
/// dependence class (this analysis has no numeric `k` to fold through, so
/// "scale by zero" can't be distinguished — a known imprecision, mirroring
/// `spec.md`'s division-as-multiplication note for the other lattice).
fn abstract_prod(a: BSizeDependence, b: BSizeDependence) -> BSizeDependence {
    if a.tag == Tag::Bot || b.tag == Tag::Bot {
        BSizeDependence::bot()
    } else if a.tag == Tag::Const && b.tag == Tag::Const {
        BSizeDependence::from_tag(Tag::Const)
    } else if a.tag == Tag::Const {
        BSizeDependence::from_tag(b.tag)
    } else if b.tag == Tag::Const {
        BSizeDependence::from_tag(a.tag)
    } else if (a.tag == Tag::Bid && b.tag == Tag::Bsize) || (a.tag == Tag::Bsize && b.tag == Tag::Bid)
    {
        BSizeDependence::bid_bsize()
    } else if (a.tag == Tag::Gsize && b.tag == Tag::Bsize) || (a.tag == Tag::Bsize && b.tag == Tag::Gsize)
    {
        BSizeDependence::constant(None)
    } else {
        BSizeDependence::top()
    }
}

fn abstract_neg(a: BSizeDependence) -> BSizeDependence {
    a
}

/// Relational/equality comparisons: constant-vs-constant is a
/// block-size-invariant boolean; any other comparison is conservatively
/// treated as block-size dependent, never merely `Top`. The comparison
/// operator itself is not modeled — this lattice can't tell `<` from `==`.
fn abstract_rel(a: BSizeDependence, b: BSizeDependence) -> BSizeDependence {
    if a.tag == Tag::Bot || b.tag == Tag::Bot {
        BSizeDependence::bot()
    } else if a.tag == Tag::Const && b.tag == Tag::Const {
        BSizeDependence::bconst()
    } else {
        BSizeDependence::bbsize()
    }
}

/// Boolean and/or. `BBsize` takes precedence over every other non-bottom
/// tag on either side (a block-size-dependent predicate taints the whole
/// conjunction/disjunction); two boolean-constants combine to a
/// boolean-constant; anything else is `Top`.
fn abstract_bool(a: BSizeDependence, b: BSizeDependence) -> BSizeDependence {
    if a.tag == Tag::Bot || b.tag == Tag::Bot {
        BSizeDependence::bot()
    } else if a.tag == Tag::BBsize || b.tag == Tag::BBsize {
        BSizeDependence::bbsize()
    } else if is_boolean_like(a) && is_boolean_like(b) {
        BSizeDependence::bconst()
    } else {
        BSizeDependence::top()
    }
}

fn eval_operand(op: &Operand, state: &AbstractState<BSizeDependence>) -> BSizeDependence {
    match *op {
        Operand::ConstInt(n) => BSizeDependence::constant(Some(n)),
        Operand::ConstNull => BSizeDependence::constant(None),
        Operand::Value(v) => state.get(v),
    }
}

/// Named externals the original pass treats as known-safe arithmetic/math
/// intrinsics: their return value is `Const` when every argument is
/// const-like, rather than unconditionally `Top`. `memcpy`/`malloc`/
/// `llvm.trap` are carried over from the original whitelist despite its own
/// `// RISKY?`/`// RISKY!` comments on those three entries.
fn is_library_call(name: &str) -> bool {
    const WHITELIST: &[&str] = &[
        "llvm.ctlz.i32",
        "llvm.nvvm.sqrt.f",
        "llvm.nvvm.saturate.f",
        "llvm.nvvm.log.f",
        "llvm.nvvm.lg2.approx.f",
        "llvm.nvvm.fmax.f",
        "llvm.nvvm.fmin.f",
        "llvm.nvvm.mul24.ui",
        "llvm.umul.with.overflow.i64",
        "llvm.nvvm.sin.f",
        "llvm.nvvm.cos.f",
        "llvm.dbg.declare",
        "memcpy",  // RISKY?
        "malloc",  // RISKY?
        "llvm.trap", // RISKY!
    ];
    WHITELIST.contains(&name) || name.contains("_wrapper")
}

/// A root-to-here index chain through shared memory: the value the chain is
/// rooted at, plus the abstract index appended at every `Gep` step so far.
type Pattern = (ValueId, Vec<BSizeDependence>);

pub struct BSizeAnalysis<'a> {
    thread_dim: Dim,
    func: &'a Function,
    arg_values: &'a mut ArgumentSummaries,
    return_values: &'a mut ReturnSummaries,
    verdicts: &'a Verdicts,
    current_pattern: Map<ValueId, Pattern>,
    canonical_pattern: Map<ValueId, Vec<BSizeDependence>>,
    pub flagged: Set<InstPoint>,
    pub sync_threads: Set<InstPoint>,
}

impl<'a> BSizeAnalysis<'a> {
    pub fn new(
        func: &'a Function,
        thread_dim: Dim,
        arg_values: &'a mut ArgumentSummaries,
        return_values: &'a mut ReturnSummaries,
        verdicts: &'a Verdicts,
    ) -> Self {
        BSizeAnalysis {
            thread_dim,
            func,
            arg_values,
            return_values,
            verdicts,
            current_pattern: Map::new(),
            canonical_pattern: Map::new(),
            flagged: Set::new(),
            sync_threads: Set::new(),
        }
    }

    /// Seeds each parameter from the call-site summary accumulated so far
    /// (`Const` if never observed), marking pointer-typed parameters as
    /// addresses. `num_threads` starts `BConst`: nothing has narrowed it yet
    /// and the block is assumed to execute the entry block in lock-step.
    pub fn initial_state(&self) -> AbstractState<BSizeDependence> {
        let mut state = AbstractState::with_num_threads(BSizeDependence::bconst());
        for (i, &param) in self.func.params.iter().enumerate() {
            let key = (self.func.id.clone(), i);
            let mut v = self
                .arg_values
                .get(&key)
                .copied()
                .unwrap_or_else(|| BSizeDependence::constant(None));
            v = v.as_address(self.func.value_type(param).is_some_and(Type::is_pointer));
            state.set(param, v);
        }
        state
    }

    /// Consults the canonical access pattern for the root `ptr_id` is
    /// chained to, if any; returns the reclassified constancy of the
    /// access (`Const` if the current pattern is an extension of the
    /// canonical one with only `Const`/`Tid` tail entries, else `Top`), and
    /// grows the canonical pattern to the longer of the two.
    fn shared_classification(&mut self, ptr_id: ValueId) -> Option<BSizeDependence> {
        let (root, current) = self.current_pattern.get(&ptr_id)?.clone();
        let canonical = self.canonical_pattern.entry(root).or_default().clone();
        let common = current.len().min(canonical.len());
        let prefix_matches = current[..common] == canonical[..common];
        let tail_ok = current[common..]
            .iter()
            .all(|v| matches!(v.tag, Tag::Const | Tag::Tid));
        let consistent = prefix_matches && tail_ok;
        if current.len() > canonical.len() {
            self.canonical_pattern.insert(root, current);
        }
        Some(if consistent {
            BSizeDependence::constant(None)
        } else {
            BSizeDependence::top()
        })
    }
}

impl<'a> Analysis for BSizeAnalysis<'a> {
    type Value = BSizeDependence;

    fn execute_instruction(
        &mut self,
        point: InstPoint,
        inst: &Instruction,
        state: &mut AbstractState<BSizeDependence>,
        _cfg: &Cfg,
    ) {
        match inst {
            Instruction::Arith { dst, op, lhs, rhs } => {
                use crate::ir::BinOp::*;
                let l = eval_operand(lhs, state);
                let r = eval_operand(rhs, state);
                let result = match op {
                    Rem | Shr | Shl => l,
                    Add | Sub => abstract_sum(l, r),
                    Mul | Div => abstract_prod(l, r),
                    Or => abstract_bool(l, r),
                    And => abstract_bool(l, r),
                    Xor => abstract_bool(l, r),
                };
                state.set(*dst, result);
            }
            Instruction::Cast { dst, src } => {
                state.set(*dst, eval_operand(src, state));
            }
            Instruction::Alloca { dst, kind } => {
                if *kind != AllocKind::Scalar {
                    state.set(*dst, BSizeDependence::constant(None).as_address(true));
                }
            }
            Instruction::Load { dst, ptr, .. } => {
                let mut v = eval_operand(ptr, state);
                if let Operand::Value(ptr_id) = ptr {
                    if let Some(classified) = self.shared_classification(*ptr_id) {
                        if classified.tag == Tag::Top {
                            self.flagged.insert(point);
                        }
                        v = classified.as_address(true);
                    }
                }
                let mut result = if v.is_address && is_const_like(v) {
                    BSizeDependence::constant(None)
                } else {
                    BSizeDependence::top()
                };
                result = result.as_address(self.func.value_type(*dst).is_some_and(Type::is_pointer));
                state.set(*dst, result);
            }
            Instruction::Store { ptr, value, .. } => {
                let mut pv = eval_operand(ptr, state);
                if let Operand::Value(ptr_id) = ptr {
                    if let Some(classified) = self.shared_classification(*ptr_id) {
                        pv = classified.as_address(true);
                    }
                }
                let sv = eval_operand(value, state);
                if pv.is_address
                    && !(is_const_like(pv) && is_const_like(sv) && is_const_like(state.num_threads))
                {
                    self.flagged.insert(point);
                }
                if !pv.is_address {
                    if let Operand::Value(ptr_id) = *ptr {
                        state.set(ptr_id, sv.as_address(false));
                    }
                }
            }
            Instruction::Gep {
                dst,
                ptr,
                indices,
                space,
            } => {
                let ptr_val = eval_operand(ptr, state);
                let mut acc = ptr_val;
                for idx in indices {
                    acc = abstract_sum(acc, eval_operand(idx, state));
                }
                acc = acc.as_address(ptr_val.is_address);
                state.set(*dst, acc);

                if let Operand::Value(ptr_id) = ptr {
                    let idx_vals: Vec<BSizeDependence> =
                        indices.iter().map(|i| eval_operand(i, state)).collect();
                    if let Some((root, pattern)) = self.current_pattern.get(ptr_id).cloned() {
                        let mut new_pattern = pattern;
                        new_pattern.extend(idx_vals);
                        self.current_pattern.insert(*dst, (root, new_pattern));
                    } else if *space == AddrSpace::Shared {
                        self.current_pattern.insert(*dst, (*ptr_id, idx_vals));
                    }
                }
            }
            Instruction::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => {
                let cv = eval_operand(cond, state);
                let result = if is_const_like(cv) {
                    eval_operand(if_true, state).join(&eval_operand(if_false, state))
                } else {
                    BSizeDependence::top()
                };
                state.set(*dst, result);
            }
            Instruction::Phi { dst, incoming } => {
                let result = incoming.iter().fold(BSizeDependence::BOTTOM, |acc, (_, op)| {
                    acc.join(&eval_operand(op, state))
                });
                state.set(*dst, result);
            }
            Instruction::Cmp { dst, lhs, rhs, .. } => {
                let l = eval_operand(lhs, state);
                let r = eval_operand(rhs, state);
                state.set(*dst, abstract_rel(l, r));
            }
            Instruction::Call { dst, callee, args } => match callee {
                Callee::InlineAsm => {
                    if let Some(d) = dst {
                        state.set(*d, BSizeDependence::top());
                    }
                }
                Callee::SpecialRegister(sr) => {
                    let v = match sr {
                        SpecialRegister::ThreadIdx(dim) if *dim == self.thread_dim => {
                            BSizeDependence::tid()
                        }
                        SpecialRegister::ThreadIdx(_) => BSizeDependence::constant(None),
                        SpecialRegister::BlockIdx(dim) if *dim == self.thread_dim => {
                            BSizeDependence::bid()
                        }
                        SpecialRegister::BlockIdx(_) => BSizeDependence::constant(None),
                        SpecialRegister::BlockDim(dim) if *dim == self.thread_dim => {
                            BSizeDependence::bsize()
                        }
                        SpecialRegister::BlockDim(_) => BSizeDependence::constant(None),
                        SpecialRegister::GridDim(dim) if *dim == self.thread_dim => {
                            BSizeDependence::gsize()
                        }
                        SpecialRegister::GridDim(_) => BSizeDependence::constant(None),
                    };
                    if let Some(d) = dst {
                        state.set(*d, v);
                    }
                }
                Callee::SyncThreads => {
                    self.sync_threads.insert(point);
                }
                Callee::Extern(name) => {
                    let arg_vals: Vec<BSizeDependence> =
                        args.iter().map(|a| eval_operand(a, state)).collect();
                    let result = if is_library_call(name) && arg_vals.iter().copied().all(is_const_like)
                    {
                        BSizeDependence::constant(None)
                    } else {
                        self.flagged.insert(point);
                        BSizeDependence::top()
                    };
                    if let Some(d) = dst {
                        state.set(*d, result);
                    }
                }
                Callee::Direct(callee_id) => {
                    let arg_vals: Vec<BSizeDependence> =
                        args.iter().map(|a| eval_operand(a, state)).collect();
                    for (i, &av) in arg_vals.iter().enumerate() {
                        let key = (callee_id.clone(), i);
                        let merged = self
                            .arg_values
                            .get(&key)
                            .copied()
                            .unwrap_or(BSizeDependence::BOTTOM)
                            .join(&av);
                        self.arg_values.insert(key, merged);
                    }

                    // If the body of the call is block-size dependent, report the
                    // call itself as dependent — a callee whose own verdict isn't
                    // known yet (recursion) is conservatively treated the same way,
                    // unless it's a whitelisted library call either way.
                    let callee_is_dependent = !self.verdicts.get(callee_id).copied().unwrap_or(false);
                    if callee_is_dependent && !is_library_call(&callee_id.0) {
                        self.flagged.insert(point);
                    }

                    let result = match self.return_values.get(callee_id) {
                        Some(&summary)
                            if is_const_like(summary) && arg_vals.iter().copied().all(is_const_like) =>
                        {
                            summary
                        }
                        _ => BSizeDependence::top(),
                    };
                    if let Some(d) = dst {
                        state.set(*d, result);
                    }
                }
            },
        }
    }

    fn execute_terminal(
        &mut self,
        _point: InstPoint,
        term: &Terminal,
        state: &AbstractState<BSizeDependence>,
        _cfg: &Cfg,
    ) -> Vec<(BbId, AbstractState<BSizeDependence>)> {
        match term {
            Terminal::Branch {
                cond,
                if_true,
                if_false,
            } => {
                let v = eval_operand(cond, state);
                let mut st1 = state.clone();
                st1.num_threads = abstract_bool(v, state.num_threads);
                let mut st2 = state.clone();
                st2.num_threads = abstract_bool(abstract_neg(v), state.num_threads);
                vec![(*if_true, st1), (*if_false, st2)]
            }
            Terminal::Jump(b) => vec![(*b, state.clone())],
            Terminal::Ret(op) => {
                let v = op
                    .as_ref()
                    .map(|o| eval_operand(o, state))
                    .unwrap_or_else(|| BSizeDependence::constant(None));
                let merged = self
                    .return_values
                    .get(&self.func.id)
                    .copied()
                    .unwrap_or(BSizeDependence::BOTTOM)
                    .join(&v);
                self.return_values.insert(self.func.id.clone(), merged);
                vec![]
            }
        }
    }
}

/// Runs the block-size-invariance analysis for `func` along `thread_dim`.
/// Returns the pre-state at every instruction, the set of flagged
/// (potentially block-size-dependent) sites, and the set of `__syncthreads`
/// call sites encountered.
pub fn analyze(
    program: &Valid<Program>,
    func_id: &FuncId,
    cfg: &Cfg,
    thread_dim: Dim,
    arg_values: &mut ArgumentSummaries,
    return_values: &mut ReturnSummaries,
    verdicts: &Verdicts,
) -> (
    Map<InstPoint, AbstractState<BSizeDependence>>,
    Set<InstPoint>,
    Set<InstPoint>,
) {
    let func = &program.functions[func_id];
    let mut analysis = BSizeAnalysis::new(func, thread_dim, arg_values, return_values, verdicts);
    let entry_state = analysis.initial_state();
    let pre_state = forward_analysis(&mut analysis, cfg, func, entry_state);
    (pre_state, analysis.flagged, analysis.sync_threads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BasicBlock, ValueInfo};
    use pretty_assertions::assert_eq;

    #[test]
    fn join_is_flat_except_through_bottom() {
        let tid = BSizeDependence::tid();
        let bid = BSizeDependence::bid();
        assert_eq!(tid.join(&BSizeDependence::BOTTOM), tid);
        assert_eq!(tid.join(&tid), tid);
        assert_eq!(tid.join(&bid), BSizeDependence::top());
    }

    #[test]
    fn sum_with_a_constant_preserves_the_other_operand_class() {
        let bsize = BSizeDependence::bsize();
        let c = BSizeDependence::constant(Some(4));
        assert_eq!(abstract_sum(bsize, c), bsize);
        assert_eq!(abstract_sum(c, bsize), bsize);
    }

    #[test]
    fn bool_op_with_bbsize_taints_the_result() {
        let bbsize = BSizeDependence::bbsize();
        let bconst = BSizeDependence::bconst();
        assert_eq!(abstract_bool(bbsize, bconst), bbsize);
        assert_eq!(abstract_bool(bconst, bbsize), bbsize);
    }

    #[test]
    fn library_whitelist_requires_all_const_args() {
        assert!(is_library_call("llvm.nvvm.sqrt.f"));
        assert!(is_library_call("cudaMalloc_wrapper"));
        assert!(!is_library_call("printf"));
    }

    #[test]
    fn join_is_commutative_associative_idempotent_with_bot_identity_and_top_absorbing() {
        let points = [
            BSizeDependence::constant(None),
            BSizeDependence::tid(),
            BSizeDependence::bid(),
            BSizeDependence::bsize(),
            BSizeDependence::gsize(),
            BSizeDependence::bid_bsize(),
            BSizeDependence::bconst(),
            BSizeDependence::bbsize(),
            BSizeDependence::top(),
        ];
        for &a in &points {
            assert_eq!(a.join(&a), a, "idempotent");
            assert_eq!(a.join(&BSizeDependence::BOTTOM), a, "bot is identity");
            assert_eq!(
                a.join(&BSizeDependence::top()),
                BSizeDependence::top(),
                "top absorbs"
            );
            for &b in &points {
                assert_eq!(a.join(&b), b.join(&a), "commutative");
                for &c in &points {
                    assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)), "associative");
                }
            }
        }
    }

    /// `Tid + BidBsize` is the coalesced global-index idiom and must collapse
    /// to `Const` regardless of argument order (spec.md's arithmetic rule).
    #[test]
    fn tid_plus_bid_bsize_collapses_to_const() {
        let tid = BSizeDependence::tid();
        let bid_bsize = BSizeDependence::bid_bsize();
        assert_eq!(abstract_sum(tid, bid_bsize), BSizeDependence::constant(None));
        assert_eq!(abstract_sum(bid_bsize, tid), BSizeDependence::constant(None));
    }

    #[test]
    fn gsize_times_bsize_collapses_to_const() {
        let gsize = BSizeDependence::gsize();
        let bsize = BSizeDependence::bsize();
        assert_eq!(abstract_prod(gsize, bsize), BSizeDependence::constant(None));
        assert_eq!(abstract_prod(bsize, gsize), BSizeDependence::constant(None));
    }

    #[test]
    fn non_constant_comparison_is_block_size_dependent_not_top() {
        assert_eq!(
            abstract_rel(BSizeDependence::tid(), BSizeDependence::bid()),
            BSizeDependence::bbsize()
        );
        assert_eq!(
            abstract_rel(BSizeDependence::constant(None), BSizeDependence::constant(None)),
            BSizeDependence::bconst()
        );
    }

    /// Printing a value never mutates it, and is a pure function of its
    /// contents (spec invariant 5).
    #[test]
    fn display_is_pure_and_does_not_depend_on_identity() {
        let v = BSizeDependence::bid_bsize().as_address(true);
        let before = v;
        let printed_once = format!("{v}");
        let printed_again = format!("{v}");
        assert_eq!(v, before);
        assert_eq!(printed_once, printed_again);

        let same_shape = BSizeDependence::bid_bsize().as_address(true);
        assert_eq!(format!("{same_shape}"), printed_once);
    }

    #[test]
    fn running_the_same_analysis_twice_is_deterministic() {
        let strided = crate::demos::strided_copy();
        let func_id = FuncId("strided_copy".into());
        let func = &strided.functions[&func_id];
        let cfg = Cfg::build(func);

        let verdicts = Verdicts::new();

        let mut args1 = ArgumentSummaries::new();
        let mut rets1 = ReturnSummaries::new();
        let (_, flagged1, _) =
            analyze(&strided, &func_id, &cfg, Dim::X, &mut args1, &mut rets1, &verdicts);

        let mut args2 = ArgumentSummaries::new();
        let mut rets2 = ReturnSummaries::new();
        let (_, flagged2, _) =
            analyze(&strided, &func_id, &cfg, Dim::X, &mut args2, &mut rets2, &verdicts);

        assert_eq!(flagged1, flagged2);
    }

    fn pointer_value_info() -> ValueInfo {
        ValueInfo {
            ty: Type::Pointer(Box::new(Type::I32), AddrSpace::Generic),
            name: None,
        }
    }

    /// A one-block function `f(a)` whose body indexes `a` by `threadIdx.x`
    /// and stores through it — block-size dependent in its own right, but
    /// returning a plain constant (so its return summary alone gives no hint
    /// of that).
    fn function_with_dependent_store(name: &str) -> Function {
        let a = ValueId(0);
        let tid = ValueId(1);
        let addr = ValueId(2);
        let mut values = Map::new();
        values.insert(a, pointer_value_info());
        let mut blocks = Map::new();
        blocks.insert(
            BbId(0),
            BasicBlock {
                id: BbId(0),
                insts: vec![
                    Instruction::Call {
                        dst: Some(tid),
                        callee: Callee::SpecialRegister(SpecialRegister::ThreadIdx(Dim::X)),
                        args: vec![],
                    },
                    Instruction::Gep {
                        dst: addr,
                        ptr: Operand::Value(a),
                        indices: vec![Operand::Value(tid)],
                        space: AddrSpace::Generic,
                    },
                    Instruction::Store {
                        ptr: Operand::Value(addr),
                        value: Operand::ConstInt(0),
                        elem_size: 4,
                    },
                ],
                term: Terminal::Ret(Some(Operand::ConstInt(0))),
            },
        );
        Function {
            id: FuncId(name.into()),
            params: vec![a],
            entry: BbId(0),
            blocks,
            values,
        }
    }

    /// A one-block function `f(a)` that only ever reads/returns a constant —
    /// block-size independent.
    fn function_with_no_dependent_access(name: &str) -> Function {
        let mut values = Map::new();
        values.insert(ValueId(0), pointer_value_info());
        let mut blocks = Map::new();
        blocks.insert(
            BbId(0),
            BasicBlock {
                id: BbId(0),
                insts: vec![],
                term: Terminal::Ret(Some(Operand::ConstInt(0))),
            },
        );
        Function {
            id: FuncId(name.into()),
            params: vec![ValueId(0)],
            entry: BbId(0),
            blocks,
            values,
        }
    }

    fn caller_calling(name: &str, callee: &str) -> Function {
        let a = ValueId(0);
        let mut values = Map::new();
        values.insert(a, pointer_value_info());
        let mut blocks = Map::new();
        blocks.insert(
            BbId(0),
            BasicBlock {
                id: BbId(0),
                insts: vec![Instruction::Call {
                    dst: None,
                    callee: Callee::Direct(FuncId(callee.into())),
                    args: vec![Operand::Value(a)],
                }],
                term: Terminal::Ret(None),
            },
        );
        Function {
            id: FuncId(name.into()),
            params: vec![a],
            entry: BbId(0),
            blocks,
            values,
        }
    }

    fn two_function_program(helper: Function, kernel: Function) -> Valid<Program> {
        let mut functions = Map::new();
        functions.insert(helper.id.clone(), helper);
        functions.insert(kernel.id.clone(), kernel);
        Program { functions }.validate().unwrap()
    }

    /// A call into a function whose own verdict is block-size dependent
    /// must be flagged at the call site regardless of whether its return
    /// summary happens to be constant — the return-value summary and the
    /// verdict are independent pieces of information.
    #[test]
    fn call_site_is_flagged_when_callee_verdict_is_dependent_even_with_a_constant_return() {
        let helper_id = FuncId("helper".into());
        let kernel_id = FuncId("kernel".into());
        let program = two_function_program(
            function_with_dependent_store("helper"),
            caller_calling("kernel", "helper"),
        );

        let helper_cfg = Cfg::build(&program.functions[&helper_id]);
        let mut args = ArgumentSummaries::new();
        let mut rets = ReturnSummaries::new();
        let no_verdicts = Verdicts::new();
        let (_, helper_flagged, helper_syncs) = analyze(
            &program,
            &helper_id,
            &helper_cfg,
            Dim::X,
            &mut args,
            &mut rets,
            &no_verdicts,
        );
        assert!(!helper_flagged.is_empty(), "helper's own store must be flagged");
        assert_eq!(rets.get(&helper_id), Some(&BSizeDependence::constant(None)));

        let mut verdicts = Verdicts::new();
        verdicts.insert(helper_id.clone(), helper_flagged.is_empty() && helper_syncs.is_empty());

        let kernel_cfg = Cfg::build(&program.functions[&kernel_id]);
        let (_, kernel_flagged, _) = analyze(
            &program,
            &kernel_id,
            &kernel_cfg,
            Dim::X,
            &mut args,
            &mut rets,
            &verdicts,
        );
        assert_eq!(kernel_flagged.len(), 1);
    }

    /// A call into a function with a known-independent verdict is not
    /// flagged at the call site.
    #[test]
    fn call_site_is_not_flagged_when_callee_verdict_is_independent() {
        let helper_id = FuncId("helper".into());
        let kernel_id = FuncId("kernel".into());
        let program = two_function_program(
            function_with_no_dependent_access("helper"),
            caller_calling("kernel", "helper"),
        );

        let mut verdicts = Verdicts::new();
        verdicts.insert(helper_id, true);

        let mut args = ArgumentSummaries::new();
        let mut rets = ReturnSummaries::new();
        let kernel_cfg = Cfg::build(&program.functions[&kernel_id]);
        let (_, kernel_flagged, _) = analyze(
            &program,
            &kernel_id,
            &kernel_cfg,
            Dim::X,
            &mut args,
            &mut rets,
            &verdicts,
        );
        assert!(kernel_flagged.is_empty());
    }

    /// A call into a function with no recorded verdict at all (e.g. a
    /// recursive callee not yet resolved) is conservatively flagged, the
    /// same way the original analysis treats an unanalyzed callee.
    #[test]
    fn call_site_with_unknown_callee_verdict_is_conservatively_flagged() {
        let kernel_id = FuncId("kernel".into());
        let program = two_function_program(
            function_with_no_dependent_access("helper"),
            caller_calling("kernel", "helper"),
        );

        let verdicts = Verdicts::new();
        let mut args = ArgumentSummaries::new();
        let mut rets = ReturnSummaries::new();
        let kernel_cfg = Cfg::build(&program.functions[&kernel_id]);
        let (_, kernel_flagged, _) = analyze(
            &program,
            &kernel_id,
            &kernel_cfg,
            Dim::X,
            &mut args,
            &mut rets,
            &verdicts,
        );
        assert_eq!(kernel_flagged.len(), 1);
    }
}
