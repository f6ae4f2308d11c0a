// The collaborator contract the analyses in this crate are written against:
// a small, concrete SSA-ish IR for single CUDA-style kernels plus the
// queries (successors, dominator tree, data layout) the engine and the
// transfer functions need from it.
//
// This is deliberately not a text format. Parsing, pretty-printing and
// serialisation of kernel IR are out of scope; callers build a `Program`
// with the constructors below (or, in tests, with small builder helpers)
// and call `validate` before handing it to an analysis.

use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt::{Display, Formatter, Result as FmtResult};

use derive_more::Display;

use crate::commons::{Valid, ValidationError};

/// A value within a single function: an instruction result or a parameter.
/// Stable for the lifetime of the `Function` it was allocated in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub u32);

/// A basic block within a single function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BbId(pub u32);

impl Display for BbId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "bb{}", self.0)
    }
}

/// A function, identified by its (unmangled) name. Functions are unique by
/// name within a `Program`, mirroring how the original pass keys its
/// per-function summary maps off `llvm::Function*` identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(pub String);

impl Display for FuncId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

/// The address space a pointer type lives in. Only the two spaces the
/// coalescing/block-size analyses actually distinguish are modeled here:
/// generic (global) memory and `__shared__` memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddrSpace {
    Generic,
    Shared,
    Constant,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Type {
    I32,
    F32,
    F64,
    Pointer(Box<Type>, AddrSpace),
    Array(Box<Type>, u64),
}

impl Type {
    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer(..))
    }

    /// Size in bytes, used for the "accesses more than 4 bytes per thread"
    /// half of the uncoalesced-access flagging rule. Aggregate sizes that
    /// this crate's IR cannot express (structs) simply don't arise: kernel
    /// arguments here are scalars or pointers to scalars/arrays.
    pub fn byte_size(&self) -> u64 {
        match self {
            Type::I32 | Type::F32 => 4,
            Type::F64 => 8,
            Type::Pointer(..) => 8,
            Type::Array(elem, len) => elem.byte_size() * len,
        }
    }
}

/// One of the three grid dimensions a kernel's thread/block indices vary
/// over. The analyses run once per dimension and union the results, since
/// which axis is "the" coalescing-sensitive one depends on how a kernel
/// maps threads to data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dim {
    X,
    Y,
    Z,
}

impl Dim {
    pub const ALL: [Dim; 3] = [Dim::X, Dim::Y, Dim::Z];
}

impl Display for Dim {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Dim::X => write!(f, "x"),
            Dim::Y => write!(f, "y"),
            Dim::Z => write!(f, "z"),
        }
    }
}

/// The four special-register families a GPU kernel reads to find out which
/// thread/block it is. Distinct from a normal `Call` because these are the
/// only place a kernel observes `threadIdx`/`blockIdx`/`blockDim`/`gridDim`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpecialRegister {
    ThreadIdx(Dim),
    BlockDim(Dim),
    BlockIdx(Dim),
    GridDim(Dim),
}

/// What a `Call` instruction invokes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Callee {
    /// A call to another function defined in this program.
    Direct(FuncId),
    /// A call to a named external function (`malloc`, `llvm.memcpy...`,
    /// math-library wrappers, and the like) the IR provider can't give a
    /// body for.
    Extern(String),
    /// A read of `threadIdx`/`blockDim`/`blockIdx`/`gridDim`.
    SpecialRegister(SpecialRegister),
    /// `__syncthreads()`.
    SyncThreads,
    /// Inline assembly: opaque, always analyzed as unknown.
    InlineAsm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocKind {
    Scalar,
    Pointer,
    Array,
}

/// A literal or a reference to a previously-defined value. Constant
/// literals are folded away by callers before they reach the IR (no
/// constant-expression pointer chains are represented, see `SPEC_FULL.md`
/// §3), so `Operand` only ever needs to distinguish "a known constant" from
/// "whatever this value turns out to hold".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operand {
    ConstInt(i64),
    ConstNull,
    Value(ValueId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum BinOp {
    #[display(fmt = "+")]
    Add,
    #[display(fmt = "-")]
    Sub,
    #[display(fmt = "*")]
    Mul,
    #[display(fmt = "/")]
    Div,
    #[display(fmt = "%")]
    Rem,
    #[display(fmt = "<<")]
    Shl,
    #[display(fmt = ">>")]
    Shr,
    #[display(fmt = "&")]
    And,
    #[display(fmt = "|")]
    Or,
    #[display(fmt = "^")]
    Xor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum CmpOp {
    #[display(fmt = "==")]
    Eq,
    #[display(fmt = "!=")]
    Ne,
    #[display(fmt = "<")]
    Lt,
    #[display(fmt = "<=")]
    Le,
    #[display(fmt = ">")]
    Gt,
    #[display(fmt = ">=")]
    Ge,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Instruction {
    Arith {
        dst: ValueId,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    Cast {
        dst: ValueId,
        src: Operand,
    },
    Alloca {
        dst: ValueId,
        kind: AllocKind,
    },
    Load {
        dst: ValueId,
        ptr: Operand,
        /// Size in bytes of the loaded element, used by the
        /// uncoalesced-access flagging rule.
        elem_size: u64,
    },
    Store {
        ptr: Operand,
        value: Operand,
        elem_size: u64,
    },
    Gep {
        dst: ValueId,
        ptr: Operand,
        indices: Vec<Operand>,
        space: AddrSpace,
    },
    Select {
        dst: ValueId,
        cond: Operand,
        if_true: Operand,
        if_false: Operand,
    },
    Phi {
        dst: ValueId,
        incoming: Vec<(BbId, Operand)>,
    },
    Cmp {
        dst: ValueId,
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
    },
    Call {
        dst: Option<ValueId>,
        callee: Callee,
        args: Vec<Operand>,
    },
}

impl Instruction {
    /// The value this instruction defines, if any.
    pub fn result(&self) -> Option<ValueId> {
        use Instruction::*;
        match self {
            Arith { dst, .. }
            | Cast { dst, .. }
            | Alloca { dst, .. }
            | Load { dst, .. }
            | Gep { dst, .. }
            | Select { dst, .. }
            | Phi { dst, .. }
            | Cmp { dst, .. } => Some(*dst),
            Call { dst, .. } => *dst,
            Store { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Terminal {
    Branch {
        cond: Operand,
        if_true: BbId,
        if_false: BbId,
    },
    Jump(BbId),
    Ret(Option<Operand>),
}

impl Terminal {
    pub fn successors(&self) -> Vec<BbId> {
        match self {
            Terminal::Branch {
                if_true, if_false, ..
            } => vec![*if_true, *if_false],
            Terminal::Jump(b) => vec![*b],
            Terminal::Ret(_) => vec![],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BbId,
    pub insts: Vec<Instruction>,
    pub term: Terminal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueInfo {
    pub ty: Type,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub id: FuncId,
    pub params: Vec<ValueId>,
    pub entry: BbId,
    pub blocks: Map<BbId, BasicBlock>,
    pub values: Map<ValueId, ValueInfo>,
}

impl Function {
    pub fn value_type(&self, v: ValueId) -> Option<&Type> {
        self.values.get(&v).map(|info| &info.ty)
    }

    pub fn block_order(&self) -> Vec<BbId> {
        self.blocks.keys().copied().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    pub functions: Map<FuncId, Function>,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("function {0} not found")]
    UnknownFunction(FuncId),
    #[error("block {0} not found in function {1}")]
    UnknownBlock(BbId, FuncId),
    #[error("value {0:?} read before it is defined in function {1}")]
    UnknownValue(ValueId, FuncId),
}

impl Program {
    /// Checks the "IR provider contract" (`spec.md` §6/§7): every terminal
    /// names a block that exists, every block is reachable from the
    /// function's entry, and `main`-less programs (library code with no
    /// kernel entry point) are still accepted — the driver's entrypoint
    /// filter only affects reporting, not validity.
    pub fn validate(self) -> Result<Valid<Program>, ValidationError> {
        let mut errors = ValidationError::new();
        for (fid, func) in &self.functions {
            errors += validate_function(fid, func);
        }
        if errors.is_empty() {
            Ok(Valid(self))
        } else {
            Err(errors)
        }
    }
}

fn validate_function(fid: &FuncId, func: &Function) -> ValidationError {
    let mut errors = ValidationError::new();

    if !func.blocks.contains_key(&func.entry) {
        errors += ValidationError::single(format!(
            "function {fid}: entry block {} is not defined",
            func.entry
        ));
    }

    for block in func.blocks.values() {
        for succ in block.term.successors() {
            if !func.blocks.contains_key(&succ) {
                errors += ValidationError::single(format!(
                    "function {fid}: block {} names undefined successor {}",
                    block.id, succ
                ));
            }
        }
        for (pred, _) in phi_incoming(block) {
            if !func.blocks.contains_key(&pred) {
                errors += ValidationError::single(format!(
                    "function {fid}: block {} has a phi incoming from undefined block {}",
                    block.id, pred
                ));
            }
        }
    }

    let reachable = reachable_blocks(func);
    for block in func.blocks.keys() {
        if !reachable.contains(block) {
            errors += ValidationError::single(format!(
                "function {fid}: block {block} is unreachable from the entry block"
            ));
        }
    }

    errors
}

fn phi_incoming(block: &BasicBlock) -> impl Iterator<Item = &(BbId, Operand)> {
    block.insts.iter().flat_map(|inst| match inst {
        Instruction::Phi { incoming, .. } => incoming.iter(),
        _ => [].iter(),
    })
}

fn reachable_blocks(func: &Function) -> Set<BbId> {
    let mut seen = Set::new();
    let mut stack = vec![func.entry];
    while let Some(b) = stack.pop() {
        if !seen.insert(b) {
            continue;
        }
        if let Some(block) = func.blocks.get(&b) {
            stack.extend(block.term.successors());
        }
    }
    seen
}

/// The successor/predecessor/dominator queries the engine and the
/// `Phi`-handling transfer function (`analyses/multiplier.rs`) need. Built
/// once per function by the driver.
pub struct Cfg {
    pub entry: BbId,
    pub succ: Map<BbId, Set<BbId>>,
    pub pred: Map<BbId, Set<BbId>>,
    idom: Map<BbId, BbId>,
}

impl Cfg {
    pub fn build(func: &Function) -> Cfg {
        let mut succ: Map<BbId, Set<BbId>> = Map::new();
        let mut pred: Map<BbId, Set<BbId>> = Map::new();
        for id in func.blocks.keys() {
            succ.entry(*id).or_default();
            pred.entry(*id).or_default();
        }
        for block in func.blocks.values() {
            for s in block.term.successors() {
                succ.entry(block.id).or_default().insert(s);
                pred.entry(s).or_default().insert(block.id);
            }
        }

        let order = reverse_postorder(func.entry, &succ);
        let idom = compute_idom(func.entry, &order, &pred);

        Cfg {
            entry: func.entry,
            succ,
            pred,
            idom,
        }
    }

    /// The immediate dominator of `block`, or `None` for the entry block.
    pub fn idom(&self, block: BbId) -> Option<BbId> {
        self.idom.get(&block).copied().filter(|&d| d != block)
    }
}

fn reverse_postorder(entry: BbId, succ: &Map<BbId, Set<BbId>>) -> Vec<BbId> {
    let mut visited = Set::new();
    let mut postorder = Vec::new();

    fn visit(
        b: BbId,
        succ: &Map<BbId, Set<BbId>>,
        visited: &mut Set<BbId>,
        postorder: &mut Vec<BbId>,
    ) {
        if !visited.insert(b) {
            return;
        }
        if let Some(succs) = succ.get(&b) {
            for &s in succs {
                visit(s, succ, visited, postorder);
            }
        }
        postorder.push(b);
    }

    visit(entry, succ, &mut visited, &mut postorder);
    postorder.reverse();
    postorder
}

/// Cooper, Harvey & Kennedy's "a simple, fast dominance algorithm":
/// iterate the intersection of already-settled predecessors' dominator
/// chains to a fixpoint, in reverse-postorder so each block usually settles
/// in one or two passes.
fn compute_idom(entry: BbId, order: &[BbId], pred: &Map<BbId, Set<BbId>>) -> Map<BbId, BbId> {
    let rpo_index: Map<BbId, usize> = order.iter().enumerate().map(|(i, &b)| (b, i)).collect();
    let mut idom: Map<BbId, BbId> = Map::new();
    idom.insert(entry, entry);

    let intersect = |idom: &Map<BbId, BbId>, mut a: BbId, mut b: BbId| -> BbId {
        while a != b {
            while rpo_index[&a] > rpo_index[&b] {
                a = idom[&a];
            }
            while rpo_index[&b] > rpo_index[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in order.iter() {
            if b == entry {
                continue;
            }
            let preds = match pred.get(&b) {
                Some(p) => p,
                None => continue,
            };
            let mut new_idom = None;
            for &p in preds {
                if idom.contains_key(&p) {
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, cur, p),
                    });
                }
            }
            if let Some(new_idom) = new_idom {
                if idom.get(&b) != Some(&new_idom) {
                    idom.insert(b, new_idom);
                    changed = true;
                }
            }
        }
    }

    idom
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn simple_loop() -> Function {
        // entry -> header -> (body -> header | exit)
        let entry = BbId(0);
        let header = BbId(1);
        let body = BbId(2);
        let exit = BbId(3);
        let cond = ValueId(0);

        let mut blocks = Map::new();
        blocks.insert(
            entry,
            BasicBlock {
                id: entry,
                insts: vec![],
                term: Terminal::Jump(header),
            },
        );
        blocks.insert(
            header,
            BasicBlock {
                id: header,
                insts: vec![],
                term: Terminal::Branch {
                    cond: Operand::Value(cond),
                    if_true: body,
                    if_false: exit,
                },
            },
        );
        blocks.insert(
            body,
            BasicBlock {
                id: body,
                insts: vec![],
                term: Terminal::Jump(header),
            },
        );
        blocks.insert(
            exit,
            BasicBlock {
                id: exit,
                insts: vec![],
                term: Terminal::Ret(None),
            },
        );

        let mut values = Map::new();
        values.insert(
            cond,
            ValueInfo {
                ty: Type::I32,
                name: None,
            },
        );

        Function {
            id: FuncId("loop".into()),
            params: vec![],
            entry,
            blocks,
            values,
        }
    }

    #[test]
    fn dominator_tree_of_a_simple_loop() {
        let f = simple_loop();
        let cfg = Cfg::build(&f);
        assert_eq!(cfg.idom(BbId(1)), Some(BbId(0)));
        assert_eq!(cfg.idom(BbId(2)), Some(BbId(1)));
        assert_eq!(cfg.idom(BbId(3)), Some(BbId(1)));
        assert_eq!(cfg.idom(BbId(0)), None);
    }

    #[test]
    fn validate_rejects_dangling_successor() {
        let mut f = simple_loop();
        f.blocks.get_mut(&BbId(3)).unwrap().term = Terminal::Jump(BbId(99));
        let mut program = Map::new();
        program.insert(f.id.clone(), f);
        let err = Program { functions: program }.validate().unwrap_err();
        assert!(!err.is_empty());
    }
}
