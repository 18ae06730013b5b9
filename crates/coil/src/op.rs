//! Opcode definitions and operand addressing modes.
//!
//! Instructions are encoded as a one-byte opcode optionally followed by a
//! two-byte little-endian operand. Each opcode declares its addressing mode,
//! which the fetch stage uses to decode the operand into a typed [`Operand`]
//! before dispatch. A byte that does not map to a variant here is a fatal
//! unknown-opcode condition - unsupported instruction families are rejected,
//! never approximated.

use strum::{Display, FromRepr, IntoStaticStr};

/// How an opcode's two-byte operand is interpreted by the fetch stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandMode {
    /// No operand bytes follow the opcode.
    None,
    /// Index into the code object's constant pool.
    Const,
    /// Index into the code object's `names` table (globals / attributes).
    Name,
    /// Index into the code object's `varnames` table (fast locals).
    Local,
    /// Index into the combined cellvars-then-freevars table.
    CellFree,
    /// Jump offset relative to the instruction following this one.
    RelJump,
    /// Absolute bytecode offset.
    AbsJump,
    /// Raw immediate (counts, comparison selectors, packed argument counts).
    Imm,
}

/// The instruction set, one dense `u8` discriminant per opcode.
///
/// The supported subset is documented per family; anything outside it
/// (starred-argument binding, `with` blocks, imports, `yield from`, format
/// values, extended args) fails decode as an unknown opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display, IntoStaticStr)]
#[repr(u8)]
pub enum Opcode {
    // --- stack shuffles ---
    PopTop,
    RotTwo,
    RotThree,
    DupTop,
    DupTopTwo,

    // --- unary operators ---
    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryInvert,

    // --- binary operators ---
    BinaryPower,
    BinaryMultiply,
    BinaryModulo,
    BinaryAdd,
    BinarySubtract,
    BinaryFloorDivide,
    BinaryTrueDivide,
    BinarySubscr,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryXor,
    BinaryOr,

    // --- in-place operators ---
    InplacePower,
    InplaceMultiply,
    InplaceModulo,
    InplaceAdd,
    InplaceSubtract,
    InplaceFloorDivide,
    InplaceTrueDivide,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceXor,
    InplaceOr,

    // --- subscripts ---
    StoreSubscr,
    DeleteSubscr,

    // --- iteration ---
    GetIter,
    /// Advance the iterator at TOS; on exhaustion pop it and jump.
    ForIter,

    /// Pop TOS and write its repr through the VM's print writer.
    PrintExpr,

    // --- control transfer signals ---
    BreakLoop,
    /// Jump to the innermost loop block's recorded restart target.
    ContinueLoop,
    ReturnValue,
    YieldValue,

    // --- block management ---
    /// Enter a loop block. The operand is the loop's exit target; the
    /// restart target recorded for `ContinueLoop` is the instruction that
    /// immediately follows. For-loops therefore push their iterator before
    /// `SetupLoop`, so `continue` re-enters at the `ForIter` instruction.
    SetupLoop,
    SetupExcept,
    SetupFinally,
    PopBlock,
    PopExcept,
    EndFinally,
    /// Raise an exception; the operand is the argument count (0, 1 or 2).
    Raise,

    // --- comprehension appends ---
    ListAppend,
    SetAdd,
    MapAdd,

    // --- constants and names ---
    LoadConst,
    LoadName,
    StoreName,
    DeleteName,
    LoadGlobal,
    StoreGlobal,
    DeleteGlobal,
    LoadFast,
    StoreFast,
    DeleteFast,
    LoadDeref,
    StoreDeref,
    LoadClosure,
    /// Push a snapshot of the frame's locals as a mapping.
    LoadLocals,

    // --- attributes ---
    LoadAttr,
    StoreAttr,
    DeleteAttr,

    // --- comparisons ---
    CompareOp,

    // --- jumps ---
    JumpForward,
    JumpAbsolute,
    PopJumpIfTrue,
    PopJumpIfFalse,
    JumpIfTrueOrPop,
    JumpIfFalseOrPop,

    // --- container builds ---
    BuildTuple,
    BuildList,
    BuildSet,
    BuildMap,
    /// Concatenate a fixed number of string fragments (formatted strings).
    BuildString,
    BuildSlice,
    UnpackSequence,

    // --- functions and calls ---
    MakeFunction,
    MakeClosure,
    CallFunction,
    CallFunctionVar,
    CallFunctionKw,
    CallFunctionVarKw,
    LoadBuildClass,
}

impl Opcode {
    /// The addressing mode of this opcode's operand.
    #[must_use]
    pub fn operand_mode(self) -> OperandMode {
        match self {
            Self::PopTop
            | Self::RotTwo
            | Self::RotThree
            | Self::DupTop
            | Self::DupTopTwo
            | Self::UnaryPositive
            | Self::UnaryNegative
            | Self::UnaryNot
            | Self::UnaryInvert
            | Self::BinaryPower
            | Self::BinaryMultiply
            | Self::BinaryModulo
            | Self::BinaryAdd
            | Self::BinarySubtract
            | Self::BinaryFloorDivide
            | Self::BinaryTrueDivide
            | Self::BinarySubscr
            | Self::BinaryLshift
            | Self::BinaryRshift
            | Self::BinaryAnd
            | Self::BinaryXor
            | Self::BinaryOr
            | Self::InplacePower
            | Self::InplaceMultiply
            | Self::InplaceModulo
            | Self::InplaceAdd
            | Self::InplaceSubtract
            | Self::InplaceFloorDivide
            | Self::InplaceTrueDivide
            | Self::InplaceLshift
            | Self::InplaceRshift
            | Self::InplaceAnd
            | Self::InplaceXor
            | Self::InplaceOr
            | Self::StoreSubscr
            | Self::DeleteSubscr
            | Self::GetIter
            | Self::PrintExpr
            | Self::BreakLoop
            | Self::ContinueLoop
            | Self::ReturnValue
            | Self::YieldValue
            | Self::PopBlock
            | Self::PopExcept
            | Self::EndFinally
            | Self::LoadLocals
            | Self::LoadBuildClass => OperandMode::None,

            Self::LoadConst => OperandMode::Const,

            Self::LoadName
            | Self::StoreName
            | Self::DeleteName
            | Self::LoadGlobal
            | Self::StoreGlobal
            | Self::DeleteGlobal
            | Self::LoadAttr
            | Self::StoreAttr
            | Self::DeleteAttr => OperandMode::Name,

            Self::LoadFast | Self::StoreFast | Self::DeleteFast => OperandMode::Local,

            Self::LoadDeref | Self::StoreDeref | Self::LoadClosure => OperandMode::CellFree,

            Self::ForIter | Self::SetupLoop | Self::SetupExcept | Self::SetupFinally | Self::JumpForward => {
                OperandMode::RelJump
            }

            Self::JumpAbsolute
            | Self::PopJumpIfTrue
            | Self::PopJumpIfFalse
            | Self::JumpIfTrueOrPop
            | Self::JumpIfFalseOrPop => OperandMode::AbsJump,

            Self::Raise
            | Self::ListAppend
            | Self::SetAdd
            | Self::MapAdd
            | Self::CompareOp
            | Self::BuildTuple
            | Self::BuildList
            | Self::BuildSet
            | Self::BuildMap
            | Self::BuildString
            | Self::BuildSlice
            | Self::UnpackSequence
            | Self::MakeFunction
            | Self::MakeClosure
            | Self::CallFunction
            | Self::CallFunctionVar
            | Self::CallFunctionKw
            | Self::CallFunctionVarKw => OperandMode::Imm,
        }
    }

    /// Whether this opcode is followed by two operand bytes.
    #[must_use]
    pub fn has_operand(self) -> bool {
        self.operand_mode() != OperandMode::None
    }
}

/// A decoded operand, tagged by addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operand {
    None,
    /// Constant-pool index.
    Const(u16),
    /// Name-table index.
    Name(u16),
    /// Fast-local slot index.
    Local(u16),
    /// Cell/free slot index (cellvars first, then freevars).
    CellFree(u16),
    /// Resolved absolute jump target.
    Jump(usize),
    /// Raw immediate.
    Imm(u16),
}

impl Operand {
    /// The table index carried by const/name/local/cell-free operands.
    pub fn index(self) -> usize {
        match self {
            Self::Const(i) | Self::Name(i) | Self::Local(i) | Self::CellFree(i) => usize::from(i),
            _ => unreachable!("operand decoded under a non-index addressing mode"),
        }
    }

    /// The resolved jump target.
    pub fn jump(self) -> usize {
        match self {
            Self::Jump(target) => target,
            _ => unreachable!("operand decoded under a non-jump addressing mode"),
        }
    }

    /// The raw immediate value.
    pub fn imm(self) -> u16 {
        match self {
            Self::Imm(v) => v,
            _ => unreachable!("operand decoded under a non-immediate addressing mode"),
        }
    }
}

/// Comparison selector carried by `CompareOp`'s immediate operand.
///
/// The discriminants match the operand encoding emitted by front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
#[repr(u8)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
    /// Except-guard match: does the raised class match the handler class?
    ExcMatch,
}
