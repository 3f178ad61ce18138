// =============================================================================
// OPCODE - Bytecode instruction words
// =============================================================================
//
// A contract's code is a flat `Vec<u16>`. Each instruction is one opcode word
// followed by a fixed number of operand words, except `DATA` and `INITVARS`
// whose first operand is a count of the words that follow it.

use serde::{Deserialize, Serialize};

macro_rules! opcodes {
    ($($name:ident = $code:literal, $operands:literal, $mnemonic:literal;)*) => {
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Opcode {
            $($name = $code,)*
        }

        impl Opcode {
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            fn fixed_operands(self) -> usize {
                match self {
                    $(Opcode::$name => $operands,)*
                }
            }
        }

        impl TryFrom<u16> for Opcode {
            type Error = u16;

            fn try_from(word: u16) -> Result<Self, Self::Error> {
                match word {
                    $($code => Ok(Opcode::$name),)*
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    Nop = 0, 0, "NOP";

    // literals and constant data
    Push16 = 1, 1, "PUSH16";
    Push32 = 2, 2, "PUSH32";
    Push64 = 3, 4, "PUSH64";
    PushStr = 4, 2, "PUSHSTR";
    Data = 5, 1, "DATA";

    // variables
    InitVars = 6, 1, "INITVARS";
    DelVars = 7, 1, "DELVARS";
    GetVar = 8, 1, "GETVAR";
    SetVar = 9, 1, "SETVAR";

    // jumps, all relative to the word after the operand
    Jmp = 10, 1, "JMP";
    JmpRel = 11, 1, "JMPREL";
    Jze = 12, 1, "JZE";
    Jnz = 13, 1, "JNZ";

    // int
    AddInt = 14, 0, "ADDINT";
    SubInt = 15, 0, "SUBINT";
    MulInt = 16, 0, "MULINT";
    DivInt = 17, 0, "DIVINT";
    ModInt = 18, 0, "MODINT";
    EqInt = 19, 0, "EQINT";
    LtInt = 20, 0, "LTINT";
    GtInt = 21, 0, "GTINT";

    // float
    AddFloat = 22, 0, "ADDFLOAT";
    SubFloat = 23, 0, "SUBFLOAT";
    MulFloat = 24, 0, "MULFLOAT";
    DivFloat = 25, 0, "DIVFLOAT";
    EqFloat = 26, 0, "EQFLOAT";
    LtFloat = 27, 0, "LTFLOAT";
    GtFloat = 28, 0, "GTFLOAT";

    // money
    AddMoney = 29, 0, "ADDMONEY";
    SubMoney = 30, 0, "SUBMONEY";
    MulMoney = 31, 0, "MULMONEY";
    DivMoney = 32, 0, "DIVMONEY";
    EqMoney = 33, 0, "EQMONEY";
    LtMoney = 34, 0, "LTMONEY";
    GtMoney = 35, 0, "GTMONEY";

    // str
    AddStr = 36, 0, "ADDSTR";
    EqStr = 37, 0, "EQSTR";

    // logic and stack
    And = 38, 0, "AND";
    Or = 39, 0, "OR";
    Not = 40, 0, "NOT";
    Dup = 41, 0, "DUP";
    SignInt = 42, 0, "SIGNINT";
    SignFloat = 43, 0, "SIGNFLOAT";
    SignMoney = 44, 0, "SIGNMONEY";

    // assignment through a place: ( place value -- )
    AssignInt = 45, 0, "ASSIGNINT";
    AssignStr = 46, 0, "ASSIGNSTR";
    AssignAddInt = 47, 0, "ASSIGNADDINT";
    AssignSubInt = 48, 0, "ASSIGNSUBINT";
    AssignMulInt = 49, 0, "ASSIGNMULINT";
    AssignDivInt = 50, 0, "ASSIGNDIVINT";
    AssignModInt = 51, 0, "ASSIGNMODINT";
    AssignAddStr = 52, 0, "ASSIGNADDSTR";
    AssignAddFloat = 53, 0, "ASSIGNADDFLOAT";
    AssignSubFloat = 54, 0, "ASSIGNSUBFLOAT";
    AssignMulFloat = 55, 0, "ASSIGNMULFLOAT";
    AssignDivFloat = 56, 0, "ASSIGNDIVFLOAT";
    AssignAddMoney = 57, 0, "ASSIGNADDMONEY";
    AssignSubMoney = 58, 0, "ASSIGNSUBMONEY";
    AssignMulMoney = 59, 0, "ASSIGNMULMONEY";
    AssignDivMoney = 60, 0, "ASSIGNDIVMONEY";
    AssignSetMap = 61, 0, "ASSIGNSETMAP";
    AssignSetArr = 62, 0, "ASSIGNSETARR";
    AssignSetBytes = 63, 0, "ASSIGNSETBYTES";
    AssignAddBytes = 64, 0, "ASSIGNADDBYTES";

    // deep copies of heap values
    Copy = 65, 1, "COPY";
    CopyStr = 66, 0, "COPYSTR";

    // calls
    CallFunc = 67, 1, "CALLFUNC";
    RetFunc = 68, 0, "RETFUNC";
    GetParams = 69, 1, "GETPARAMS";
    CustomFunc = 70, 1, "CUSTOMFUNC";
    EmbedFunc = 71, 1, "EMBEDFUNC";
    CallContract = 72, 1, "CALLCONTRACT";
    ParContract = 73, 2, "PARCONTRACT";
    LoadPars = 74, 0, "LOADPARS";

    // containers
    GetIndex = 75, 0, "GETINDEX";
    SetIndex = 76, 0, "SETINDEX";
    GetMap = 77, 0, "GETMAP";
    SetMap = 78, 0, "SETMAP";
    AppendArr = 79, 0, "APPENDARR";
    InitArr = 80, 1, "INITARR";
    InitMap = 81, 1, "INITMAP";
    InitObj = 82, 1, "INITOBJ";
    InitObjList = 83, 1, "INITOBJLIST";
    Obj2List = 84, 0, "OBJ2LIST";

    // host environment and result
    Env = 85, 1, "ENV";
    Return = 86, 1, "RETURN";
}

impl Opcode {
    /// Instructions whose single operand is a signed relative offset.
    pub fn is_relative(self) -> bool {
        matches!(
            self,
            Opcode::Jmp | Opcode::JmpRel | Opcode::Jze | Opcode::Jnz | Opcode::CallFunc
        )
    }

    /// Number of operand words following the opcode at `code[at]`.
    ///
    /// Variable-width instructions read their count from the first operand;
    /// a truncated count word yields the fixed width so callers can report
    /// the truncation themselves.
    pub fn operand_len(self, code: &[u16], at: usize) -> usize {
        match self {
            Opcode::Data | Opcode::InitVars => match code.get(at + 1) {
                Some(&count) => 1 + count as usize,
                None => 1,
            },
            _ => self.fixed_operands(),
        }
    }
}

impl From<Opcode> for u16 {
    fn from(op: Opcode) -> u16 {
        op as u16
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Target of a relative jump whose operand word sits at `operand_at`.
pub fn jump_target(operand_at: usize, offset: u16) -> Option<usize> {
    let target = operand_at as i64 + 1 + (offset as i16) as i64;
    usize::try_from(target).ok()
}
