//! Opcode table and instruction word encoding.
//!
//! An instruction is one 32-bit word: the low 16 bits are the opcode, the
//! high 16 bits carry an inline operand (a type tag, variable index,
//! parameter count, embed ID or block shift). Opcodes that need more data
//! read the following word(s); see each variant's doc line.

/// Block frame flags carried in the `InitVars` inline operand.
pub const BL_BREAK: u16 = 0x0001;
pub const BL_CONTINUE: u16 = 0x0002;
pub const BL_VARS: u16 = 0x0004;
pub const BL_PARS: u16 = 0x0008;
pub const BL_TRY: u16 = 0x0010;
pub const BL_RECOVER: u16 = 0x0020;
pub const BL_RETRY: u16 = 0x0040;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Nop = 0,
    Push32,    // +1 word: i32, sign-extended
    Push64,    // +2 words: low then high half of the i64 bits
    PushFloat, // +2 words: low then high half of the f64 bits
    PushStr,   // operand: string pool ID
    PushFunc,  // +1 word: function ID
    Add,       // int + int
    Sub,
    Mul,
    Div, // div-zero trap
    Mod, // div-zero trap
    BitOr,
    BitXor,
    BitAnd,
    Lshift, // shift-range trap on negative count
    Rshift,
    BitNot,
    Sign, // -int
    Eq,
    Lt,
    Gt,
    Not, // logical: 0 <-> 1
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    SignFloat,
    EqFloat,
    LtFloat,
    GtFloat,
    AddStr, // concatenation
    EqStr,
    LtStr,
    GtStr,
    GetVar, // operand: block shift; +1 word: (index << 16) | type tag
    SetVar, // operand: block shift; +1 word: (index << 16) | type tag;
    // +1 word: (assign op << 16) | index count; + level words; IncDec adds a delta word
    Dup, // operand: type tag
    Pop, // operand: type tag
    Cycle,
    Jmp,      // +1 word: relative offset from this instruction
    Jze,      // +1 word: branch if popped int is zero
    Jnz,      // +1 word: branch if popped int is not zero
    Jeq,      // operand: type tag; +1 word: branch if case value equals switch value
    JmpOpt,   // operand: optional var index; +1 word: branch if the optional was supplied
    InitVars, // operand: flags; conditional shift words; (par count << 16) | var count; var tags
    DelVars,
    OptPars, // operand: count; + count words: (var index << 16) | type tag
    InitObj, // operand: element count; +1 word: (element tag << 16) | object tag
    Range,
    Array, // operand: element count; +1 word: element tag
    Len,   // operand: container tag
    ForInc, // operand: int slot index within the innermost frame
    Break,
    Continue,
    Recover,
    Retry,
    Ret, // operand: return type tag
    End,
    ConstById, // +1 word: constant ID
    CallById,  // operand: par count; +1 word: function ID
    GoById,    // operand: par count; +1 word: function ID; +1 word: packed par storage codes
    Embed,     // operand: embed ID; variadic adds a count word + per-argument tags
    Local,     // operand: par count; +1 word: code offset
    Catch,
    Iota,  // operand: iota ordinal
    Index, // operand: level count; + level words: (result tag << 16) | container tag
    // Assignment family: selector codes carried in SetVar's assign operand,
    // never dispatched standalone.
    AssignPtr,
    Assign,
    AssignAdd,
    AssignSub,
    AssignMul,
    AssignDiv,
    AssignMod,
    AssignBitOr,
    AssignBitXor,
    AssignBitAnd,
    AssignLshift,
    AssignRshift,
    IncDec, // one extra level-list word: delta (+1/-1)
    EmbedFunc, // operand: par count; pops a func value from the any stack
}

impl Opcode {
    pub fn from_u16(raw: u16) -> Option<Opcode> {
        let op = match raw {
            0 => Opcode::Nop,
            1 => Opcode::Push32,
            2 => Opcode::Push64,
            3 => Opcode::PushFloat,
            4 => Opcode::PushStr,
            5 => Opcode::PushFunc,
            6 => Opcode::Add,
            7 => Opcode::Sub,
            8 => Opcode::Mul,
            9 => Opcode::Div,
            10 => Opcode::Mod,
            11 => Opcode::BitOr,
            12 => Opcode::BitXor,
            13 => Opcode::BitAnd,
            14 => Opcode::Lshift,
            15 => Opcode::Rshift,
            16 => Opcode::BitNot,
            17 => Opcode::Sign,
            18 => Opcode::Eq,
            19 => Opcode::Lt,
            20 => Opcode::Gt,
            21 => Opcode::Not,
            22 => Opcode::AddFloat,
            23 => Opcode::SubFloat,
            24 => Opcode::MulFloat,
            25 => Opcode::DivFloat,
            26 => Opcode::SignFloat,
            27 => Opcode::EqFloat,
            28 => Opcode::LtFloat,
            29 => Opcode::GtFloat,
            30 => Opcode::AddStr,
            31 => Opcode::EqStr,
            32 => Opcode::LtStr,
            33 => Opcode::GtStr,
            34 => Opcode::GetVar,
            35 => Opcode::SetVar,
            36 => Opcode::Dup,
            37 => Opcode::Pop,
            38 => Opcode::Cycle,
            39 => Opcode::Jmp,
            40 => Opcode::Jze,
            41 => Opcode::Jnz,
            42 => Opcode::Jeq,
            43 => Opcode::JmpOpt,
            44 => Opcode::InitVars,
            45 => Opcode::DelVars,
            46 => Opcode::OptPars,
            47 => Opcode::InitObj,
            48 => Opcode::Range,
            49 => Opcode::Array,
            50 => Opcode::Len,
            51 => Opcode::ForInc,
            52 => Opcode::Break,
            53 => Opcode::Continue,
            54 => Opcode::Recover,
            55 => Opcode::Retry,
            56 => Opcode::Ret,
            57 => Opcode::End,
            58 => Opcode::ConstById,
            59 => Opcode::CallById,
            60 => Opcode::GoById,
            61 => Opcode::Embed,
            62 => Opcode::Local,
            63 => Opcode::Catch,
            64 => Opcode::Iota,
            65 => Opcode::Index,
            66 => Opcode::AssignPtr,
            67 => Opcode::Assign,
            68 => Opcode::AssignAdd,
            69 => Opcode::AssignSub,
            70 => Opcode::AssignMul,
            71 => Opcode::AssignDiv,
            72 => Opcode::AssignMod,
            73 => Opcode::AssignBitOr,
            74 => Opcode::AssignBitXor,
            75 => Opcode::AssignBitAnd,
            76 => Opcode::AssignLshift,
            77 => Opcode::AssignRshift,
            78 => Opcode::IncDec,
            79 => Opcode::EmbedFunc,
            _ => return None,
        };
        Some(op)
    }
}

/// Opcode half of an instruction word.
#[inline]
pub fn op_of(word: i32) -> u16 {
    (word as u32 & 0xffff) as u16
}

/// Inline operand half of an instruction word.
#[inline]
pub fn param_of(word: i32) -> u16 {
    ((word as u32) >> 16) as u16
}

/// Pack an opcode and its inline operand into one word.
#[inline]
pub fn word(op: Opcode, param: u16) -> i32 {
    ((param as u32) << 16 | op as u32) as i32
}

/// Pack two 16-bit halves into an operand word (low, high).
#[inline]
pub fn pack(low: u16, high: u16) -> i32 {
    ((high as u32) << 16 | low as u32) as i32
}

/// Split an operand word into its (low, high) halves.
#[inline]
pub fn unpack(word: i32) -> (u16, u16) {
    ((word as u32 & 0xffff) as u16, ((word as u32) >> 16) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_roundtrip() {
        let w = word(Opcode::PushStr, 0x1234);
        assert_eq!(op_of(w), Opcode::PushStr as u16);
        assert_eq!(param_of(w), 0x1234);
        assert_eq!(Opcode::from_u16(op_of(w)), Some(Opcode::PushStr));
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert_eq!(Opcode::from_u16(Opcode::EmbedFunc as u16 + 1), None);
        assert_eq!(Opcode::from_u16(0xffff), None);
    }

    #[test]
    fn decode_matches_discriminants() {
        for raw in 0..=Opcode::EmbedFunc as u16 {
            let op = Opcode::from_u16(raw).expect("valid opcode");
            assert_eq!(op as u16, raw);
        }
    }

    #[test]
    fn pack_negative_halves() {
        let w = pack(0xfffe, 0x8001);
        let (lo, hi) = unpack(w);
        assert_eq!(lo, 0xfffe);
        assert_eq!(hi, 0x8001);
    }
}
