//! Location lists and the DWARF location expression stack machine.
//!
//! A [`Loclist`] is a decoded operator sequence plus the frame base context
//! it evaluates against. Resolution runs every operator in order against a
//! value stack, keeping a derivation trace, and returns the top of the
//! stack. A result that is an address rather than a value is dereferenced
//! through the coprocessor as the final step.
//!
//! `.debug_loc` entries are parsed by [`LoclistSection`]; the expression
//! bytes inside each entry decode with [`Operator::decode`].

use crate::coproc::CoProc;
use crate::dwarf::frame::FrameSection;
use crate::error::LocationError;
use crate::leb128::{decode_sleb128, decode_uleb128};
use bytes::Bytes;
use gimli::constants as dw;
use parking_lot::Mutex;
use std::sync::Arc;

/// A resolved point in the location derivation. `value` is the working
/// scalar; `value_ok` false means the scalar is an address still to be
/// dereferenced. Once a deferred address has been read, `address` records
/// where the datum lives.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Location {
    pub address: u64,
    pub address_ok: bool,
    pub value: u32,
    pub value_ok: bool,
    pub operator: &'static str,
}

/// Last resolved location of a variable. Written on the emulator thread,
/// read from the UI thread; the critical section is a plain copy.
#[derive(Debug, Default)]
pub struct LocationCell(Mutex<Location>);

impl LocationCell {
    pub fn set(&self, loc: Location) {
        *self.0.lock() = loc;
    }

    pub fn get(&self) -> Location {
        *self.0.lock()
    }
}

/// Where `fbreg` and `call_frame_cfa` find their frame base.
#[derive(Clone, Default)]
pub enum FrameBase {
    #[default]
    None,

    /// A function's frame base expression, itself a loclist.
    Loclist(Arc<Loclist>),

    /// Call frame information from `.debug_frame`.
    Cfa(Arc<FrameSection>),
}

impl FrameBase {
    pub fn framebase(&self, coproc: &dyn CoProc) -> Result<u64, LocationError> {
        match self {
            FrameBase::None => Err(LocationError::NoFrameBase),
            FrameBase::Loclist(l) => Ok(l.resolve_raw(coproc)?.location.value as u64),
            FrameBase::Cfa(f) => f.framebase(coproc),
        }
    }
}

/// A single decoded operator. The name is the DWARF mnemonic, kept for the
/// derivation trace.
#[derive(Clone, Debug)]
pub struct Operator {
    name: &'static str,
    kind: OperatorKind,
}

#[derive(Clone, Debug)]
enum OperatorKind {
    /// Push a memory address. Resolution dereferences it at the end.
    Address(u32),

    /// Push a literal or decoded constant.
    Constant(u32),

    /// Pop an address, push the 32bit word at that address.
    Deref,

    /// As `Deref` but reading `size` bytes, zero extended.
    DerefSize(u8),

    Dup,
    Abs,
    And,
    Div,
    Minus,
    Mod,
    Mul,
    Neg,
    Not,
    Or,
    Plus,
    PlusUconst(u32),
    Shl,
    Shr,
    Shra,
    Xor,

    /// Push the value of a register.
    Register(u32),

    /// Push register value plus offset, as an address.
    RegisterOffset(u32, i32),

    /// Push frame base plus offset, as an address.
    FrameBaseOffset(i32),

    /// Pop and mask the top of stack to `size` bytes.
    Piece(u32),

    Nop,

    /// Push the canonical frame address.
    CallFrameCfa,

    /// The top of stack is the datum itself, not an address.
    StackValue,

    /// Synthesised for derived variables: parent's resolved address plus a
    /// fixed offset (array element or composite member).
    ParentOffset {
        parent: Arc<LocationCell>,
        offset: u64,
    },

    /// Synthesised for pointer dereference: the parent's value is the
    /// child's address.
    ParentDeref { parent: Arc<LocationCell> },
}

impl Operator {
    /// Decode one operator from expression bytes. Returns the operator and
    /// the number of bytes consumed.
    pub fn decode(expr: &[u8]) -> Result<(Operator, usize), LocationError> {
        let opcode = *expr.first().ok_or(LocationError::TruncatedExpression)?;
        let rest = &expr[1..];
        let name = dw::DwOp(opcode).static_string().unwrap_or("DW_OP_unknown");

        let op = |kind, consumed| Ok((Operator { name, kind }, consumed));

        if (dw::DW_OP_lit0.0..=dw::DW_OP_lit31.0).contains(&opcode) {
            return op(OperatorKind::Constant((opcode - dw::DW_OP_lit0.0) as u32), 1);
        }
        if (dw::DW_OP_reg0.0..=dw::DW_OP_reg31.0).contains(&opcode) {
            return op(OperatorKind::Register((opcode - dw::DW_OP_reg0.0) as u32), 1);
        }
        if (dw::DW_OP_breg0.0..=dw::DW_OP_breg31.0).contains(&opcode) {
            let (off, n) = decode_sleb128(rest);
            return op(
                OperatorKind::RegisterOffset((opcode - dw::DW_OP_breg0.0) as u32, off as i32),
                1 + n,
            );
        }

        match dw::DwOp(opcode) {
            dw::DW_OP_addr => {
                let b = rest.get(..4).ok_or(LocationError::TruncatedExpression)?;
                op(
                    OperatorKind::Address(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                    5,
                )
            }
            dw::DW_OP_deref => op(OperatorKind::Deref, 1),
            dw::DW_OP_const1u => {
                let b = *rest.first().ok_or(LocationError::TruncatedExpression)?;
                op(OperatorKind::Constant(b as u32), 2)
            }
            dw::DW_OP_const1s => {
                let b = *rest.first().ok_or(LocationError::TruncatedExpression)?;
                op(OperatorKind::Constant(b as i8 as i32 as u32), 2)
            }
            dw::DW_OP_const2u => {
                let b = rest.get(..2).ok_or(LocationError::TruncatedExpression)?;
                op(
                    OperatorKind::Constant(u16::from_le_bytes([b[0], b[1]]) as u32),
                    3,
                )
            }
            dw::DW_OP_const2s => {
                let b = rest.get(..2).ok_or(LocationError::TruncatedExpression)?;
                op(
                    OperatorKind::Constant(i16::from_le_bytes([b[0], b[1]]) as i32 as u32),
                    3,
                )
            }
            dw::DW_OP_const4u | dw::DW_OP_const4s => {
                let b = rest.get(..4).ok_or(LocationError::TruncatedExpression)?;
                op(
                    OperatorKind::Constant(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                    5,
                )
            }
            dw::DW_OP_constu => {
                let (v, n) = decode_uleb128(rest);
                op(OperatorKind::Constant(v as u32), 1 + n)
            }
            dw::DW_OP_consts => {
                let (v, n) = decode_sleb128(rest);
                op(OperatorKind::Constant(v as i32 as u32), 1 + n)
            }
            dw::DW_OP_dup => op(OperatorKind::Dup, 1),
            dw::DW_OP_abs => op(OperatorKind::Abs, 1),
            dw::DW_OP_and => op(OperatorKind::And, 1),
            dw::DW_OP_div => op(OperatorKind::Div, 1),
            dw::DW_OP_minus => op(OperatorKind::Minus, 1),
            dw::DW_OP_mod => op(OperatorKind::Mod, 1),
            dw::DW_OP_mul => op(OperatorKind::Mul, 1),
            dw::DW_OP_neg => op(OperatorKind::Neg, 1),
            dw::DW_OP_not => op(OperatorKind::Not, 1),
            dw::DW_OP_or => op(OperatorKind::Or, 1),
            dw::DW_OP_plus => op(OperatorKind::Plus, 1),
            dw::DW_OP_plus_uconst => {
                let (v, n) = decode_uleb128(rest);
                op(OperatorKind::PlusUconst(v as u32), 1 + n)
            }
            dw::DW_OP_shl => op(OperatorKind::Shl, 1),
            dw::DW_OP_shr => op(OperatorKind::Shr, 1),
            dw::DW_OP_shra => op(OperatorKind::Shra, 1),
            dw::DW_OP_xor => op(OperatorKind::Xor, 1),
            dw::DW_OP_regx => {
                let (v, n) = decode_uleb128(rest);
                op(OperatorKind::Register(v as u32), 1 + n)
            }
            dw::DW_OP_fbreg => {
                let (v, n) = decode_sleb128(rest);
                op(OperatorKind::FrameBaseOffset(v as i32), 1 + n)
            }
            dw::DW_OP_piece => {
                let (v, n) = decode_uleb128(rest);
                op(OperatorKind::Piece(v as u32), 1 + n)
            }
            dw::DW_OP_deref_size => {
                let b = *rest.first().ok_or(LocationError::TruncatedExpression)?;
                op(OperatorKind::DerefSize(b), 2)
            }
            dw::DW_OP_nop => op(OperatorKind::Nop, 1),
            dw::DW_OP_call_frame_cfa => op(OperatorKind::CallFrameCfa, 1),
            dw::DW_OP_stack_value => op(OperatorKind::StackValue, 1),
            dw::DW_OP_bra
            | dw::DW_OP_eq
            | dw::DW_OP_ge
            | dw::DW_OP_gt
            | dw::DW_OP_le
            | dw::DW_OP_lt
            | dw::DW_OP_ne
            | dw::DW_OP_skip
            | dw::DW_OP_xderef
            | dw::DW_OP_xderef_size => Err(LocationError::UnimplementedOpcode(name)),
            _ => Err(LocationError::UnknownOpcode(opcode)),
        }
    }
}

/// Outcome of [`Loclist::resolve`]. When the final dereference of a
/// deferred address fails, `location` still carries the address and `error`
/// records the failure.
#[derive(Debug, Clone, Default)]
pub struct ResolvedLocation {
    pub location: Location,
    pub derivation: Vec<Location>,
    pub error: Option<LocationError>,
}

/// A location expression bound to its frame base context.
#[derive(Clone, Default)]
pub struct Loclist {
    ops: Vec<Operator>,
    framebase: FrameBase,
}

impl Loclist {
    pub fn new(framebase: FrameBase) -> Loclist {
        Loclist {
            ops: vec![],
            framebase,
        }
    }

    /// Decode a whole expression into a loclist.
    pub fn from_expr(expr: &[u8], framebase: FrameBase) -> Result<Loclist, LocationError> {
        let mut loclist = Loclist::new(framebase);
        let mut c = 0;
        while c < expr.len() {
            let (operator, n) = Operator::decode(&expr[c..])?;
            loclist.ops.push(operator);
            c += n;
        }
        Ok(loclist)
    }

    /// Loclist for a derived variable: parent's resolved address plus a
    /// fixed offset.
    pub fn parent_offset(parent: Arc<LocationCell>, offset: u64) -> Loclist {
        Loclist {
            ops: vec![Operator {
                name: "offset",
                kind: OperatorKind::ParentOffset { parent, offset },
            }],
            framebase: FrameBase::None,
        }
    }

    /// Loclist for a pointer dereference child.
    pub fn parent_deref(parent: Arc<LocationCell>) -> Loclist {
        Loclist {
            ops: vec![Operator {
                name: "deref pointer",
                kind: OperatorKind::ParentDeref { parent },
            }],
            framebase: FrameBase::None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append a decoded operator.
    pub fn push(&mut self, op: Operator) {
        self.ops.push(op);
    }

    /// Run the operators and return the top of the stack. A deferred
    /// address is dereferenced through the coprocessor; if that read fails
    /// the returned location keeps the address and `error` is set.
    pub fn resolve(&self, coproc: &dyn CoProc) -> Result<ResolvedLocation, LocationError> {
        let mut res = self.resolve_raw(coproc)?;

        if !res.location.value_ok {
            let addr = res.location.value;
            res.location.address = addr as u64;
            res.location.address_ok = true;
            match coproc.read_u32(addr) {
                Some(v) => {
                    res.location.value = v;
                    res.location.value_ok = true;
                }
                None => res.error = Some(LocationError::UnreadableAddress(addr)),
            }
        }

        Ok(res)
    }

    /// As [`Loclist::resolve`] but without the final dereference. Used when
    /// the expression result is wanted as a scalar, for example a frame
    /// base.
    pub fn resolve_raw(&self, coproc: &dyn CoProc) -> Result<ResolvedLocation, LocationError> {
        let mut stack: Vec<Location> = vec![];
        let mut derivation: Vec<Location> = vec![];

        for operator in &self.ops {
            if let Some(loc) = self.step(operator, coproc, &mut stack)? {
                stack.push(loc);
                derivation.push(loc);
            }
        }

        let location = stack.last().copied().ok_or(LocationError::EmptyStack)?;

        Ok(ResolvedLocation {
            location,
            derivation,
            error: None,
        })
    }

    fn step(
        &self,
        operator: &Operator,
        coproc: &dyn CoProc,
        stack: &mut Vec<Location>,
    ) -> Result<Option<Location>, LocationError> {
        let name = operator.name;

        let value = |value: u32| Location {
            value,
            value_ok: true,
            operator: name,
            ..Location::default()
        };
        let address = |value: u32| Location {
            value,
            value_ok: false,
            operator: name,
            ..Location::default()
        };

        fn pop(stack: &mut Vec<Location>) -> Result<Location, LocationError> {
            stack.pop().ok_or(LocationError::EmptyStack)
        }

        let loc = match &operator.kind {
            OperatorKind::Address(a) => address(*a),
            OperatorKind::Constant(v) => value(*v),
            OperatorKind::Deref => {
                let a = pop(stack)?;
                let v = coproc
                    .read_u32(a.value)
                    .ok_or(LocationError::UnreadableAddress(a.value))?;
                Location {
                    address: a.value as u64,
                    address_ok: true,
                    value: v,
                    value_ok: true,
                    operator: name,
                }
            }
            OperatorKind::DerefSize(size) => {
                let a = pop(stack)?;
                let v = coproc
                    .read_u32(a.value)
                    .ok_or(LocationError::UnreadableAddress(a.value))?;
                Location {
                    address: a.value as u64,
                    address_ok: true,
                    value: v & size_mask(*size),
                    value_ok: true,
                    operator: name,
                }
            }
            OperatorKind::Dup => *stack.last().ok_or(LocationError::EmptyStack)?,
            OperatorKind::Abs => {
                let a = pop(stack)?;
                Location {
                    value: (a.value as i32).unsigned_abs(),
                    operator: name,
                    ..a
                }
            }
            OperatorKind::Neg => {
                let a = pop(stack)?;
                Location {
                    value: (a.value as i32).wrapping_neg() as u32,
                    operator: name,
                    ..a
                }
            }
            OperatorKind::Not => {
                let a = pop(stack)?;
                Location {
                    value: !a.value,
                    operator: name,
                    ..a
                }
            }
            OperatorKind::And
            | OperatorKind::Div
            | OperatorKind::Minus
            | OperatorKind::Mod
            | OperatorKind::Mul
            | OperatorKind::Or
            | OperatorKind::Plus
            | OperatorKind::Shl
            | OperatorKind::Shr
            | OperatorKind::Shra
            | OperatorKind::Xor => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                let v = binary_op(&operator.kind, a.value, b.value)?;
                Location {
                    value: v,
                    value_ok: a.value_ok && b.value_ok,
                    operator: name,
                    ..Location::default()
                }
            }
            OperatorKind::PlusUconst(k) => {
                let a = pop(stack)?;
                Location {
                    value: a.value.wrapping_add(*k),
                    operator: name,
                    ..a
                }
            }
            OperatorKind::Register(n) => {
                let v = coproc
                    .read_reg(*n)
                    .ok_or(LocationError::UnknownRegister(*n))?;
                value(v)
            }
            OperatorKind::RegisterOffset(n, off) => {
                let v = coproc
                    .read_reg(*n)
                    .ok_or(LocationError::UnknownRegister(*n))?;
                address((v as i64 + *off as i64) as u32)
            }
            OperatorKind::FrameBaseOffset(off) => {
                let fb = self.framebase.framebase(coproc)?;
                address((fb as i64 + *off as i64) as u32)
            }
            OperatorKind::Piece(size) => {
                let a = pop(stack)?;
                Location {
                    value: a.value & size_mask_bytes(*size),
                    operator: name,
                    ..a
                }
            }
            OperatorKind::Nop => return Ok(None),
            OperatorKind::CallFrameCfa => {
                let fb = self.framebase.framebase(coproc)?;
                value(fb as u32)
            }
            OperatorKind::StackValue => {
                let a = pop(stack)?;
                Location {
                    value_ok: true,
                    operator: name,
                    ..a
                }
            }
            OperatorKind::ParentOffset { parent, offset } => {
                let base = parent.get();
                if !base.address_ok {
                    return Err(LocationError::ParentUnresolved);
                }
                address((base.address + offset) as u32)
            }
            OperatorKind::ParentDeref { parent } => {
                let base = parent.get();
                if !base.value_ok {
                    return Err(LocationError::ParentUnresolved);
                }
                address(base.value)
            }
        };

        Ok(Some(loc))
    }
}

fn binary_op(kind: &OperatorKind, a: u32, b: u32) -> Result<u32, LocationError> {
    Ok(match kind {
        OperatorKind::And => a & b,
        OperatorKind::Div => {
            if b == 0 {
                return Err(LocationError::DivisionByZero);
            }
            ((a as i32).wrapping_div(b as i32)) as u32
        }
        OperatorKind::Minus => a.wrapping_sub(b),
        OperatorKind::Mod => {
            if b == 0 {
                return Err(LocationError::DivisionByZero);
            }
            a % b
        }
        OperatorKind::Mul => a.wrapping_mul(b),
        OperatorKind::Or => a | b,
        OperatorKind::Plus => a.wrapping_add(b),
        OperatorKind::Shl => a.wrapping_shl(b),
        OperatorKind::Shr => a.wrapping_shr(b),
        OperatorKind::Shra => ((a as i32).wrapping_shr(b)) as u32,
        OperatorKind::Xor => a ^ b,
        _ => unreachable!("not a binary operator"),
    })
}

fn size_mask(size: u8) -> u32 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        3 => 0x00ff_ffff,
        _ => u32::MAX,
    }
}

fn size_mask_bytes(size: u32) -> u32 {
    if size >= 4 {
        u32::MAX
    } else {
        size_mask(size as u8)
    }
}

/// An address range and the loclist that applies inside it. The range is
/// inclusive at both ends.
#[derive(Clone)]
pub struct LoclistEntry {
    pub start: u32,
    pub end: u32,
    pub loclist: Loclist,
}

/// The `.debug_loc` section: per-PC-range location expressions.
pub struct LoclistSection {
    data: Bytes,
}

impl LoclistSection {
    pub fn new(data: Bytes) -> LoclistSection {
        LoclistSection { data }
    }

    /// Parse the location list at `offset`. `base` is the relocated low PC
    /// of the compilation unit; a base address selection entry replaces it.
    pub fn loclists(
        &self,
        offset: u64,
        base: u32,
        framebase: FrameBase,
    ) -> Result<Vec<LoclistEntry>, LocationError> {
        let mut entries = vec![];
        let mut base = base;
        let mut c = offset as usize;

        loop {
            let b = self
                .data
                .get(c..c + 8)
                .ok_or(LocationError::TruncatedExpression)?;
            let start = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            let end = u32::from_le_bytes([b[4], b[5], b[6], b[7]]);
            c += 8;

            if start == 0 && end == 0 {
                break;
            }

            // base address selection
            if start == 0xffff_ffff {
                base = end;
                continue;
            }

            let b = self
                .data
                .get(c..c + 2)
                .ok_or(LocationError::TruncatedExpression)?;
            let expr_len = u16::from_le_bytes([b[0], b[1]]) as usize;
            c += 2;

            let expr = self
                .data
                .get(c..c + expr_len)
                .ok_or(LocationError::TruncatedExpression)?;
            c += expr_len;

            // zero length ranges have no effect
            if end == start {
                continue;
            }

            entries.push(LoclistEntry {
                start: base.wrapping_add(start),
                end: base.wrapping_add(end).wrapping_sub(1),
                loclist: Loclist::from_expr(expr, framebase.clone())?,
            });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    pub struct MockCoProc {
        pub regs: [u32; 16],
        pub mem: std::collections::HashMap<u32, u32>,
    }

    impl Default for MockCoProc {
        fn default() -> Self {
            MockCoProc {
                regs: [0; 16],
                mem: Default::default(),
            }
        }
    }

    impl CoProc for MockCoProc {
        fn read_reg(&self, n: u32) -> Option<u32> {
            self.regs.get(n as usize).copied()
        }

        fn read_u32(&self, addr: u32) -> Option<u32> {
            self.mem.get(&addr).copied()
        }
    }

    fn resolve(expr: &[u8], coproc: &MockCoProc) -> ResolvedLocation {
        Loclist::from_expr(expr, FrameBase::None)
            .unwrap()
            .resolve(coproc)
            .unwrap()
    }

    #[test]
    fn literals() {
        let coproc = MockCoProc::default();
        for n in 0..32_u8 {
            let res = resolve(&[0x30 + n], &coproc);
            assert_eq!(res.location.value, n as u32);
            assert!(res.location.value_ok);
        }
    }

    #[test]
    fn plus_uconst() {
        let coproc = MockCoProc::default();
        // lit5, plus_uconst 200
        let res = resolve(&[0x35, 0x23, 0xc8, 0x01], &coproc);
        assert_eq!(res.location.value, 205);
    }

    #[test]
    fn registers() {
        let mut coproc = MockCoProc::default();
        coproc.regs[3] = 0xcafe;
        let res = resolve(&[0x53], &coproc); // reg3
        assert_eq!(res.location.value, 0xcafe);
        assert!(res.location.value_ok);
    }

    #[test]
    fn register_offset_defers() {
        let mut coproc = MockCoProc::default();
        coproc.regs[7] = 0x2000_0000;
        coproc.mem.insert(0x2000_0004, 99);

        // breg7 +4
        let loclist = Loclist::from_expr(&[0x77, 0x04], FrameBase::None).unwrap();
        let raw = loclist.resolve_raw(&coproc).unwrap();
        assert_eq!(raw.location.value, 0x2000_0004);
        assert!(!raw.location.value_ok);

        let res = loclist.resolve(&coproc).unwrap();
        assert_eq!(res.location.address, 0x2000_0004);
        assert!(res.location.address_ok);
        assert_eq!(res.location.value, 99);
        assert!(res.location.value_ok);
    }

    #[test]
    fn addr_deref() {
        let mut coproc = MockCoProc::default();
        coproc.mem.insert(0x2000_0140, 0xdead_beef);

        // addr 0x20000140
        let res = resolve(&[0x03, 0x40, 0x01, 0x00, 0x20], &coproc);
        assert_eq!(res.location.address, 0x2000_0140);
        assert_eq!(res.location.value, 0xdead_beef);
        assert!(res.location.value_ok);
    }

    #[test]
    fn addr_unreadable() {
        let coproc = MockCoProc::default();
        let res = resolve(&[0x03, 0x40, 0x01, 0x00, 0x20], &coproc);
        assert!(!res.location.value_ok);
        assert!(res.location.address_ok);
        assert_eq!(
            res.error,
            Some(LocationError::UnreadableAddress(0x2000_0140))
        );
    }

    #[test]
    fn stack_value_is_final() {
        let mut coproc = MockCoProc::default();
        coproc.regs[2] = 0x1234;

        // breg2 +0, stack_value: the computed address is the value
        let res = resolve(&[0x72, 0x00, 0x9f], &coproc);
        assert_eq!(res.location.value, 0x1234);
        assert!(res.location.value_ok);
        assert!(!res.location.address_ok);
    }

    #[test]
    fn arithmetic() {
        let coproc = MockCoProc::default();
        // lit8 lit2 shl -> 32
        assert_eq!(resolve(&[0x38, 0x32, 0x24], &coproc).location.value, 32);
        // lit8 lit2 minus -> 6
        assert_eq!(resolve(&[0x38, 0x32, 0x1c], &coproc).location.value, 6);
        // const1s -2 abs -> 2
        assert_eq!(resolve(&[0x09, 0xfe, 0x19], &coproc).location.value, 2);
        // lit1 neg shra by lit0 stays negative
        let res = resolve(&[0x31, 0x1f], &coproc);
        assert_eq!(res.location.value as i32, -1);
    }

    #[test]
    fn empty_stack() {
        let coproc = MockCoProc::default();
        let loclist = Loclist::from_expr(&[], FrameBase::None).unwrap();
        assert_eq!(
            loclist.resolve(&coproc).unwrap_err(),
            LocationError::EmptyStack
        );
    }

    #[test]
    fn unimplemented_opcode() {
        // DW_OP_eq
        assert!(matches!(
            Operator::decode(&[0x29]),
            Err(LocationError::UnimplementedOpcode(_))
        ));
    }

    #[test]
    fn fbreg() {
        let mut coproc = MockCoProc::default();
        coproc.regs[13] = 0x4000_0100;
        coproc.mem.insert(0x4000_00fc, 7);

        // frame base is breg13 +0
        let fb = Arc::new(Loclist::from_expr(&[0x7d, 0x00], FrameBase::None).unwrap());

        // fbreg -4
        let loclist = Loclist::from_expr(&[0x91, 0x7c], FrameBase::Loclist(fb)).unwrap();
        let raw = loclist.resolve_raw(&coproc).unwrap();
        assert_eq!(raw.location.value, 0x4000_00fc);
        assert!(!raw.location.value_ok);

        let res = loclist.resolve(&coproc).unwrap();
        assert_eq!(res.location.address, 0x4000_00fc);
        assert_eq!(res.location.value, 7);
    }

    // a local addressed off the canonical frame address: the frame base
    // expression is call_frame_cfa, the CFA rule comes from .debug_frame
    #[test]
    fn fbreg_via_call_frame_cfa() {
        let mut coproc = MockCoProc::default();
        coproc.regs[13] = 0x4000_0100;
        coproc.regs[15] = 0x8004;
        coproc.mem.insert(0x4000_00fc, 42);

        let mut d: Vec<u8> = vec![];
        let cie_body: Vec<u8> = vec![
            1,    // version
            0,    // augmentation ""
            2,    // code alignment
            0x7c, // data alignment -4
            14,   // return address register
            0x0c, 13, 0, // def_cfa r13, 0
        ];
        d.extend(((cie_body.len() + 4) as u32).to_le_bytes());
        d.extend(0xffff_ffff_u32.to_le_bytes());
        d.extend(&cie_body);
        let fde_body: Vec<u8> = {
            let mut b: Vec<u8> = vec![];
            b.extend(0x8000_u32.to_le_bytes());
            b.extend(0x20_u32.to_le_bytes());
            b
        };
        d.extend(((fde_body.len() + 4) as u32).to_le_bytes());
        d.extend(0_u32.to_le_bytes());
        d.extend(&fde_body);

        let frame = Arc::new(FrameSection::new(Bytes::from(d), 0).unwrap());
        let fb = Arc::new(Loclist::from_expr(&[0x9c], FrameBase::Cfa(frame)).unwrap());

        // x lives at fbreg -4
        let x = Loclist::from_expr(&[0x91, 0x7c], FrameBase::Loclist(fb)).unwrap();
        let res = x.resolve(&coproc).unwrap();
        assert_eq!(res.location.address, 0x4000_00fc);
        assert!(res.location.address_ok);
        assert_eq!(res.location.value, 42);
    }

    #[test]
    fn derivation_trace() {
        let coproc = MockCoProc::default();
        let res = resolve(&[0x35, 0x23, 0x02], &coproc); // lit5, plus_uconst 2
        assert_eq!(res.derivation.len(), 2);
        assert_eq!(res.derivation[0].operator, "DW_OP_lit5");
        assert_eq!(res.derivation[1].operator, "DW_OP_plus_uconst");
    }

    #[test]
    fn loclist_section_entries() {
        let mut data: Vec<u8> = vec![];
        // base address selection -> 0x9000
        data.extend(0xffff_ffff_u32.to_le_bytes());
        data.extend(0x9000_u32.to_le_bytes());
        // entry [0x10, 0x20): reg0
        data.extend(0x10_u32.to_le_bytes());
        data.extend(0x20_u32.to_le_bytes());
        data.extend(1_u16.to_le_bytes());
        data.push(0x50);
        // zero length entry, dropped
        data.extend(0x30_u32.to_le_bytes());
        data.extend(0x30_u32.to_le_bytes());
        data.extend(1_u16.to_le_bytes());
        data.push(0x50);
        // terminator
        data.extend(0_u64.to_le_bytes());

        let section = LoclistSection::new(Bytes::from(data));
        let entries = section.loclists(0, 0x8000, FrameBase::None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start, 0x9010);
        assert_eq!(entries[0].end, 0x901f);
    }
}
