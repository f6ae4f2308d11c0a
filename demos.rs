//! A couple of small, hand-built kernels used by `bin/warpcheck.rs` to
//! demonstrate the two analyses without a text IR format to parse one from
//! (see `ir.rs`'s module doc: parsing kernel IR is out of scope here, so a
//! caller either builds a `Program` directly or picks one of these).

use std::collections::BTreeMap as Map;

use crate::commons::Valid;
use crate::ir::*;

fn i32_param(id: u32) -> (ValueId, ValueInfo) {
    (
        ValueId(id),
        ValueInfo {
            ty: Type::I32,
            name: None,
        },
    )
}

fn ptr_param(id: u32) -> (ValueId, ValueInfo) {
    (
        ValueId(id),
        ValueInfo {
            ty: Type::Pointer(Box::new(Type::I32), AddrSpace::Generic),
            name: None,
        },
    )
}

/// `out[threadIdx.x] = in[threadIdx.x];` — each thread reads and writes a
/// distinct, contiguous word: no uncoalesced access, no block-size
/// dependence.
pub fn coalesced_copy() -> Valid<Program> {
    let out_ptr = ValueId(0);
    let in_ptr = ValueId(1);
    let tid = ValueId(2);
    let src_addr = ValueId(3);
    let loaded = ValueId(4);
    let dst_addr = ValueId(5);

    let mut values = Map::new();
    values.insert(out_ptr, ptr_param(0).1);
    values.insert(in_ptr, ptr_param(1).1);
    values.insert(tid, i32_param(2).1);
    values.insert(src_addr, ptr_param(3).1);
    values.insert(dst_addr, ptr_param(5).1);

    let entry = BbId(0);
    let mut blocks = Map::new();
    blocks.insert(
        entry,
        BasicBlock {
            id: entry,
            insts: vec![
                Instruction::Call {
                    dst: Some(tid),
                    callee: Callee::SpecialRegister(SpecialRegister::ThreadIdx(Dim::X)),
                    args: vec![],
                },
                Instruction::Gep {
                    dst: src_addr,
                    ptr: Operand::Value(in_ptr),
                    indices: vec![Operand::Value(tid)],
                    space: AddrSpace::Generic,
                },
                Instruction::Load {
                    dst: loaded,
                    ptr: Operand::Value(src_addr),
                    elem_size: 4,
                },
                Instruction::Gep {
                    dst: dst_addr,
                    ptr: Operand::Value(out_ptr),
                    indices: vec![Operand::Value(tid)],
                    space: AddrSpace::Generic,
                },
                Instruction::Store {
                    ptr: Operand::Value(dst_addr),
                    value: Operand::Value(loaded),
                    elem_size: 4,
                },
            ],
            term: Terminal::Ret(None),
        },
    );

    let func = Function {
        id: FuncId("coalesced_copy".into()),
        params: vec![out_ptr, in_ptr],
        entry,
        blocks,
        values,
    };
    let mut functions = Map::new();
    functions.insert(func.id.clone(), func);
    Program { functions }
        .validate()
        .expect("demo kernel is well-formed by construction")
}

/// `out[threadIdx.x * stride] = in[threadIdx.x * stride];` where `stride` is
/// a runtime parameter: the per-thread address is an unknown linear
/// function of the thread index, so both accesses are flagged as possibly
/// uncoalesced.
pub fn strided_copy() -> Valid<Program> {
    let out_ptr = ValueId(0);
    let in_ptr = ValueId(1);
    let stride = ValueId(2);
    let tid = ValueId(3);
    let offset = ValueId(4);
    let src_addr = ValueId(5);
    let loaded = ValueId(6);
    let dst_addr = ValueId(7);

    let mut values = Map::new();
    values.insert(out_ptr, ptr_param(0).1);
    values.insert(in_ptr, ptr_param(1).1);
    values.insert(stride, i32_param(2).1);
    values.insert(tid, i32_param(3).1);
    values.insert(offset, i32_param(4).1);
    values.insert(src_addr, ptr_param(5).1);
    values.insert(dst_addr, ptr_param(7).1);

    let entry = BbId(0);
    let mut blocks = Map::new();
    blocks.insert(
        entry,
        BasicBlock {
            id: entry,
            insts: vec![
                Instruction::Call {
                    dst: Some(tid),
                    callee: Callee::SpecialRegister(SpecialRegister::ThreadIdx(Dim::X)),
                    args: vec![],
                },
                Instruction::Arith {
                    dst: offset,
                    op: BinOp::Mul,
                    lhs: Operand::Value(tid),
                    rhs: Operand::Value(stride),
                },
                Instruction::Gep {
                    dst: src_addr,
                    ptr: Operand::Value(in_ptr),
                    indices: vec![Operand::Value(offset)],
                    space: AddrSpace::Generic,
                },
                Instruction::Load {
                    dst: loaded,
                    ptr: Operand::Value(src_addr),
                    elem_size: 4,
                },
                Instruction::Gep {
                    dst: dst_addr,
                    ptr: Operand::Value(out_ptr),
                    indices: vec![Operand::Value(offset)],
                    space: AddrSpace::Generic,
                },
                Instruction::Store {
                    ptr: Operand::Value(dst_addr),
                    value: Operand::Value(loaded),
                    elem_size: 4,
                },
            ],
            term: Terminal::Ret(None),
        },
    );

    let func = Function {
        id: FuncId("strided_copy".into()),
        params: vec![out_ptr, in_ptr, stride],
        entry,
        blocks,
        values,
    };
    let mut functions = Map::new();
    functions.insert(func.id.clone(), func);
    Program { functions }
        .validate()
        .expect("demo kernel is well-formed by construction")
}

pub fn named(name: &str) -> Option<Valid<Program>> {
    match name {
        "coalesced-copy" => Some(coalesced_copy()),
        "strided-copy" => Some(strided_copy()),
        _ => None,
    }
}

pub const NAMES: &[&str] = &["coalesced-copy", "strided-copy"];
