//! Uncoalesced-memory-access detection.
//!
//! Tracks, for every SSA value, its *multiplier*: how its value changes as a
//! linear function of `threadIdx` along the dimension currently under
//! analysis (`Bot` nothing known yet, `Zero` constant across the warp, `One`
//! / `NegOne` increases/decreases one-for-one with the thread index, `Top`
//! anything else). A memory access through a pointer whose multiplier is
//! not `Zero` touches a different address per thread; if the threads in a
//! warp are also not known to execute in lock-step (`num_threads == Top`)
//! and the element being accessed is wider than 4 bytes, or the multiplier
//! is `Top`, the access can't be proven coalesced and is flagged.

use std::collections::BTreeSet as Set;
use std::fmt::{Display, Formatter, Result as FmtResult};

use derive_more::Display as DisplayDerive;

use crate::commons::Valid;
use crate::engine::{forward_analysis, Analysis, InstPoint};
use crate::ir::{
    AllocKind, BbId, Callee, Cfg, Dim, Function, FuncId, Instruction, Operand, Program,
    SpecialRegister, Terminal, Type,
};
use crate::lattice::{AbstractState, AbstractValue};
use std::collections::BTreeMap as Map;

#[derive(Clone, Copy, Debug, PartialEq, Eq, DisplayDerive)]
pub enum Tag {
    #[display(fmt = "_|_")]
    Bot,
    #[display(fmt = "0")]
    Zero,
    #[display(fmt = "1")]
    One,
    #[display(fmt = "-1")]
    NegOne,
    #[display(fmt = "u")]
    Top,
}

/// The per-analysis summary of a call's arguments, keyed by callee and
/// parameter index, threaded across the whole interprocedural driver run.
pub type ArgumentSummaries = Map<(FuncId, usize), Multiplier>;

/// The per-function join of every value returned along every path,
/// populated by a callee's own `Ret` handling and consulted by its callers.
pub type ReturnSummaries = Map<FuncId, Multiplier>;

fn is_constant(v: Multiplier) -> bool {
    v.tag == Tag::Zero
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Multiplier {
    pub tag: Tag,
    pub is_address: bool,
}

impl Multiplier {
    pub fn bot() -> Self {
        Multiplier {
            tag: Tag::Bot,
            is_address: false,
        }
    }
    pub fn zero() -> Self {
        Multiplier {
            tag: Tag::Zero,
            is_address: false,
        }
    }
    pub fn one() -> Self {
        Multiplier {
            tag: Tag::One,
            is_address: false,
        }
    }
    pub fn neg_one() -> Self {
        Multiplier {
            tag: Tag::NegOne,
            is_address: false,
        }
    }
    pub fn top() -> Self {
        Multiplier {
            tag: Tag::Top,
            is_address: false,
        }
    }

    fn from_tag(tag: Tag) -> Self {
        Multiplier {
            tag,
            is_address: false,
        }
    }

    pub fn constant(n: i64) -> Self {
        Multiplier::from_tag(multiplier_tag_of_int(n))
    }

    fn as_address(self, is_address: bool) -> Self {
        Multiplier { is_address, ..self }
    }
}

impl Display for Multiplier {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if self.is_address {
            write!(f, "*")?;
        }
        write!(f, "{}", self.tag)
    }
}

impl AbstractValue for Multiplier {
    const BOTTOM: Self = Multiplier {
        tag: Tag::Bot,
        is_address: false,
    };

    fn join(&self, other: &Self) -> Self {
        match (self.tag, other.tag) {
            (Tag::Bot, _) => *other,
            (_, Tag::Bot) => *self,
            (a, b) if a == b => Multiplier::from_tag(a),
            _ => Multiplier::top(),
        }
    }
}

fn multiplier_tag_of_int(n: i64) -> Tag {
    match n {
        0 => Tag::Zero,
        1 => Tag::One,
        -1 => Tag::NegOne,
        _ => Tag::Top,
    }
}

fn int_of_multiplier_tag(t: Tag) -> i64 {
    match t {
        Tag::Zero => 0,
        Tag::One => 1,
        Tag::NegOne => -1,
        // only ever invoked on Zero/One/NegOne; the Bot/Top cases are
        // filtered out by callers before reaching here.
        _ => 0,
    }
}

fn add(a: Multiplier, b: Multiplier) -> Multiplier {
    if a.tag == Tag::Bot || b.tag == Tag::Bot {
        Multiplier::bot()
    } else if a.tag == Tag::Top || b.tag == Tag::Top {
        Multiplier::top()
    } else {
        Multiplier::from_tag(multiplier_tag_of_int(
            int_of_multiplier_tag(a.tag) + int_of_multiplier_tag(b.tag),
        ))
    }
}

fn mul(a: Multiplier, b: Multiplier) -> Multiplier {
    if a.tag == Tag::Bot || b.tag == Tag::Bot {
        Multiplier::bot()
    } else if a.tag == Tag::Zero && b.tag == Tag::Zero {
        Multiplier::zero()
    } else {
        Multiplier::top()
    }
}

fn neg(a: Multiplier) -> Multiplier {
    match a.tag {
        Tag::Bot | Tag::Top => a,
        _ => Multiplier::from_tag(multiplier_tag_of_int(-int_of_multiplier_tag(a.tag))),
    }
}

fn is_one_or_neg_one(t: Tag) -> bool {
    matches!(t, Tag::One | Tag::NegOne)
}

fn eq(a: Multiplier, b: Multiplier) -> Multiplier {
    if a.tag == Tag::Bot || b.tag == Tag::Bot {
        Multiplier::bot()
    } else if a.tag != Tag::Top && b.tag != Tag::Top && a.tag == b.tag {
        Multiplier::zero()
    } else if (a.tag == Tag::Zero && is_one_or_neg_one(b.tag))
        || (b.tag == Tag::Zero && is_one_or_neg_one(a.tag))
    {
        Multiplier::one()
    } else {
        Multiplier::top()
    }
}

fn neq(a: Multiplier, b: Multiplier) -> Multiplier {
    if a.tag == Tag::Bot || b.tag == Tag::Bot {
        Multiplier::bot()
    } else if a.tag != Tag::Top && b.tag != Tag::Top && a.tag == b.tag {
        Multiplier::zero()
    } else if (a.tag == Tag::Zero && is_one_or_neg_one(b.tag))
        || (b.tag == Tag::Zero && is_one_or_neg_one(a.tag))
    {
        Multiplier::neg_one()
    } else {
        Multiplier::top()
    }
}

fn and(a: Multiplier, b: Multiplier) -> Multiplier {
    if a.tag == Tag::Bot || b.tag == Tag::Bot {
        Multiplier::bot()
    } else if a.tag == Tag::Zero && b.tag == Tag::Zero {
        Multiplier::zero()
    } else if a.tag == Tag::One || b.tag == Tag::One {
        Multiplier::one()
    } else {
        Multiplier::top()
    }
}

fn or(a: Multiplier, b: Multiplier) -> Multiplier {
    if a.tag == Tag::Bot || b.tag == Tag::Bot {
        Multiplier::bot()
    } else if a.tag == Tag::Zero && b.tag == Tag::Zero {
        Multiplier::zero()
    } else if a.tag == Tag::NegOne || b.tag == Tag::NegOne {
        Multiplier::neg_one()
    } else {
        Multiplier::top()
    }
}

fn eval_operand(op: &Operand, state: &AbstractState<Multiplier>) -> Multiplier {
    match *op {
        Operand::ConstInt(n) => Multiplier::constant(n),
        Operand::ConstNull => Multiplier::zero(),
        Operand::Value(v) => state.get(v),
    }
}

/// `v.isAddressType() && numThreads==TOP && ((elemSize>4 && (ONE|NEGONE)) ||
/// v==TOP)`, the rule shared by `Load` and `Store`.
fn is_uncoalesced(v: Multiplier, elem_size: u64, num_threads: Tag) -> bool {
    v.is_address
        && num_threads == Tag::Top
        && ((elem_size > 4 && is_one_or_neg_one(v.tag)) || v.tag == Tag::Top)
}

pub struct MultiplierAnalysis<'a> {
    thread_dim: Dim,
    func: &'a Function,
    arg_values: &'a mut ArgumentSummaries,
    return_values: &'a mut ReturnSummaries,
    pub flagged: Set<InstPoint>,
}

impl<'a> MultiplierAnalysis<'a> {
    pub fn new(
        func: &'a Function,
        thread_dim: Dim,
        arg_values: &'a mut ArgumentSummaries,
        return_values: &'a mut ReturnSummaries,
    ) -> Self {
        MultiplierAnalysis {
            thread_dim,
            func,
            arg_values,
            return_values,
            flagged: Set::new(),
        }
    }

    /// Seeds each parameter from the summary accumulated across call sites
    /// seen so far (or `Zero` for a parameter never observed at a call
    /// site), marking pointer-typed parameters as addresses. `num_threads`
    /// starts `Top`: nothing is known yet about whether the block executes
    /// in lock-step.
    pub fn initial_state(&self) -> AbstractState<Multiplier> {
        let mut state = AbstractState::with_num_threads(Multiplier::top());
        for (i, &param) in self.func.params.iter().enumerate() {
            let key = (self.func.id.clone(), i);
            let mut v = self
                .arg_values
                .get(&key)
                .copied()
                .unwrap_or_else(Multiplier::zero);
            v = v.as_address(self.func.value_type(param).is_some_and(Type::is_pointer));
            state.set(param, v);
        }
        state
    }
}

impl<'a> Analysis for MultiplierAnalysis<'a> {
    type Value = Multiplier;

    fn execute_instruction(
        &mut self,
        point: InstPoint,
        inst: &Instruction,
        state: &mut AbstractState<Multiplier>,
        cfg: &Cfg,
    ) {
        match inst {
            Instruction::Arith { dst, op, lhs, rhs } => {
                use crate::ir::BinOp::*;
                let l = eval_operand(lhs, state);
                let r = eval_operand(rhs, state);
                let result = match op {
                    Rem | Shr => l,
                    Add => add(l, r),
                    Sub => add(l, neg(r)),
                    Shl | Mul | Div => mul(l, r),
                    Or => or(l, r),
                    And => and(l, r),
                    Xor => or(and(l, neg(r)), and(r, neg(l))),
                };
                state.set(*dst, result);
            }
            Instruction::Cast { dst, src } => {
                state.set(*dst, eval_operand(src, state));
            }
            Instruction::Alloca { dst, kind } => {
                if *kind != AllocKind::Scalar {
                    state.set(*dst, Multiplier::zero().as_address(true));
                }
            }
            Instruction::Load {
                dst,
                ptr,
                elem_size,
            } => {
                let v = eval_operand(ptr, state);
                if is_uncoalesced(v, *elem_size, state.num_threads.tag) {
                    self.flagged.insert(point);
                }
                let mut result = if v.is_address && is_constant(v) {
                    Multiplier::zero()
                } else {
                    Multiplier::top()
                };
                result = result.as_address(self.func.value_type(*dst).is_some_and(Type::is_pointer));
                state.set(*dst, result);
            }
            Instruction::Store {
                ptr,
                value,
                elem_size,
            } => {
                let v = eval_operand(ptr, state);
                if is_uncoalesced(v, *elem_size, state.num_threads.tag) {
                    self.flagged.insert(point);
                }
                if !v.is_address {
                    if let Operand::Value(ptr_id) = *ptr {
                        let stored = eval_operand(value, state).as_address(false);
                        state.set(ptr_id, stored);
                    }
                }
            }
            Instruction::Gep {
                dst, ptr, indices, ..
            } => {
                let ptr_val = eval_operand(ptr, state);
                let mut acc = ptr_val;
                for idx in indices {
                    acc = add(acc, eval_operand(idx, state));
                }
                acc = acc.as_address(ptr_val.is_address);
                state.set(*dst, acc);
            }
            Instruction::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => {
                let cv = eval_operand(cond, state);
                let result = if is_constant(cv) {
                    eval_operand(if_true, state).join(&eval_operand(if_false, state))
                } else {
                    Multiplier::top()
                };
                state.set(*dst, result);
            }
            Instruction::Phi { dst, incoming } => {
                let gate = cfg.idom(point.block).and_then(|d| {
                    match &self.func.blocks[&d].term {
                        Terminal::Branch { cond, .. } => Some(eval_operand(cond, state)),
                        _ => None,
                    }
                });
                let result = match gate {
                    Some(cv) if cv.tag == Tag::Zero => incoming
                        .iter()
                        .fold(Multiplier::BOTTOM, |acc, (_, op)| acc.join(&eval_operand(op, state))),
                    _ => Multiplier::top(),
                };
                state.set(*dst, result);
            }
            Instruction::Cmp { dst, op, lhs, rhs } => {
                use crate::ir::CmpOp::*;
                let l = eval_operand(lhs, state);
                let r = eval_operand(rhs, state);
                let result = match op {
                    Eq => eq(l, r),
                    Ne => neq(l, r),
                    _ => Multiplier::top(),
                };
                state.set(*dst, result);
            }
            Instruction::Call { dst, callee, args } => {
                match callee {
                    Callee::InlineAsm => {
                        if let Some(d) = dst {
                            state.set(*d, Multiplier::top());
                        }
                    }
                    Callee::SpecialRegister(sr) => {
                        let v = match sr {
                            SpecialRegister::ThreadIdx(dim) if *dim == self.thread_dim => {
                                Multiplier::one()
                            }
                            SpecialRegister::ThreadIdx(_)
                            | SpecialRegister::BlockDim(_)
                            | SpecialRegister::BlockIdx(_)
                            | SpecialRegister::GridDim(_) => Multiplier::zero(),
                        };
                        if let Some(d) = dst {
                            state.set(*d, v);
                        }
                    }
                    Callee::SyncThreads => {}
                    Callee::Extern(_) => {
                        if let Some(d) = dst {
                            state.set(*d, Multiplier::top());
                        }
                    }
                    Callee::Direct(callee_id) => {
                        let arg_vals: Vec<Multiplier> =
                            args.iter().map(|a| eval_operand(a, state)).collect();
                        for (i, &av) in arg_vals.iter().enumerate() {
                            let key = (callee_id.clone(), i);
                            let merged = self
                                .arg_values
                                .get(&key)
                                .copied()
                                .unwrap_or(Multiplier::BOTTOM)
                                .join(&av);
                            self.arg_values.insert(key, merged);
                        }
                        if let Some(d) = dst {
                            let result = match self.return_values.get(callee_id) {
                                Some(&summary)
                                    if is_constant(summary) && arg_vals.iter().copied().all(is_constant) =>
                                {
                                    summary
                                }
                                Some(_) | None => Multiplier::top(),
                            };
                            state.set(*d, result);
                        }
                    }
                }
            }
        }
    }

    fn execute_terminal(
        &mut self,
        _point: InstPoint,
        term: &Terminal,
        state: &AbstractState<Multiplier>,
        _cfg: &Cfg,
    ) -> Vec<(BbId, AbstractState<Multiplier>)> {
        match term {
            Terminal::Branch {
                cond,
                if_true,
                if_false,
            } => {
                let v = eval_operand(cond, state);
                let mut st1 = state.clone();
                st1.num_threads = and(v, state.num_threads);
                let mut st2 = state.clone();
                st2.num_threads = and(neg(v), state.num_threads);
                vec![(*if_true, st1), (*if_false, st2)]
            }
            Terminal::Jump(b) => vec![(*b, state.clone())],
            Terminal::Ret(op) => {
                let v = op
                    .as_ref()
                    .map(|o| eval_operand(o, state))
                    .unwrap_or_else(Multiplier::zero);
                let merged = self
                    .return_values
                    .get(&self.func.id)
                    .copied()
                    .unwrap_or(Multiplier::BOTTOM)
                    .join(&v);
                self.return_values.insert(self.func.id.clone(), merged);
                vec![]
            }
        }
    }
}

/// Runs the uncoalesced-access analysis for `func` along `thread_dim`,
/// seeding parameters from (and updating) the shared `arg_values` summary.
/// Returns the pre-state at every instruction plus the set of flagged
/// (potentially uncoalesced) load/store sites.
pub fn analyze(
    program: &Valid<Program>,
    func_id: &FuncId,
    cfg: &Cfg,
    thread_dim: Dim,
    arg_values: &mut ArgumentSummaries,
    return_values: &mut ReturnSummaries,
) -> (Map<InstPoint, AbstractState<Multiplier>>, Set<InstPoint>) {
    let func = &program.functions[func_id];
    let mut analysis = MultiplierAnalysis::new(func, thread_dim, arg_values, return_values);
    let entry_state = analysis.initial_state();
    let pre_state = forward_analysis(&mut analysis, cfg, func, entry_state);
    (pre_state, analysis.flagged)
}
