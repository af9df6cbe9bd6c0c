// =============================================================================
// OPCODE - Bytecode instructions
// =============================================================================

/// One-byte instruction opcodes. Operands follow inline in the code stream:
/// constant-pool indexes and stack slots are one byte, jump offsets are two
/// bytes big-endian, and `Closure` is followed by an (is-local, index) byte
/// pair per captured upvalue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // literals
    Constant,
    Nil,
    True,
    False,

    Pop,

    // variable access
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,

    // comparison
    Equal,
    Greater,
    Less,

    // arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,

    Not,
    Negate,

    Print,

    // control flow
    Jump,
    JumpIfFalse,
    Loop,

    // functions
    Call,
    Closure,
    CloseUpvalue,
    Return,
}

impl OpCode {
    /// Mnemonic used by the disassembler.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Constant => "CONSTANT",
            OpCode::Nil => "NIL",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Pop => "POP",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::DefineGlobal => "DEF_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::GetUpvalue => "GET_UPVALUE",
            OpCode::SetUpvalue => "SET_UPVALUE",
            OpCode::Equal => "EQUAL",
            OpCode::Greater => "GREATER",
            OpCode::Less => "LESS",
            OpCode::Add => "ADD",
            OpCode::Subtract => "SUBTRACT",
            OpCode::Multiply => "MULTIPLY",
            OpCode::Divide => "DIVIDE",
            OpCode::Not => "NOT",
            OpCode::Negate => "NEGATE",
            OpCode::Print => "PRINT",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::Loop => "LOOP",
            OpCode::Call => "CALL",
            OpCode::Closure => "CLOSURE",
            OpCode::CloseUpvalue => "CLOSE_UPVALUE",
            OpCode::Return => "RETURN",
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        let op = match byte {
            b if b == OpCode::Constant as u8 => OpCode::Constant,
            b if b == OpCode::Nil as u8 => OpCode::Nil,
            b if b == OpCode::True as u8 => OpCode::True,
            b if b == OpCode::False as u8 => OpCode::False,
            b if b == OpCode::Pop as u8 => OpCode::Pop,
            b if b == OpCode::GetLocal as u8 => OpCode::GetLocal,
            b if b == OpCode::SetLocal as u8 => OpCode::SetLocal,
            b if b == OpCode::GetGlobal as u8 => OpCode::GetGlobal,
            b if b == OpCode::DefineGlobal as u8 => OpCode::DefineGlobal,
            b if b == OpCode::SetGlobal as u8 => OpCode::SetGlobal,
            b if b == OpCode::GetUpvalue as u8 => OpCode::GetUpvalue,
            b if b == OpCode::SetUpvalue as u8 => OpCode::SetUpvalue,
            b if b == OpCode::Equal as u8 => OpCode::Equal,
            b if b == OpCode::Greater as u8 => OpCode::Greater,
            b if b == OpCode::Less as u8 => OpCode::Less,
            b if b == OpCode::Add as u8 => OpCode::Add,
            b if b == OpCode::Subtract as u8 => OpCode::Subtract,
            b if b == OpCode::Multiply as u8 => OpCode::Multiply,
            b if b == OpCode::Divide as u8 => OpCode::Divide,
            b if b == OpCode::Not as u8 => OpCode::Not,
            b if b == OpCode::Negate as u8 => OpCode::Negate,
            b if b == OpCode::Print as u8 => OpCode::Print,
            b if b == OpCode::Jump as u8 => OpCode::Jump,
            b if b == OpCode::JumpIfFalse as u8 => OpCode::JumpIfFalse,
            b if b == OpCode::Loop as u8 => OpCode::Loop,
            b if b == OpCode::Call as u8 => OpCode::Call,
            b if b == OpCode::Closure as u8 => OpCode::Closure,
            b if b == OpCode::CloseUpvalue as u8 => OpCode::CloseUpvalue,
            b if b == OpCode::Return as u8 => OpCode::Return,
            other => return Err(other),
        };
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip() {
        for byte in 0..=OpCode::Return as u8 {
            let op = OpCode::try_from(byte).expect("every opcode byte decodes");
            assert_eq!(u8::from(op), byte);
        }
    }

    #[test]
    fn test_unknown_byte_is_rejected() {
        assert_eq!(OpCode::try_from(0xff), Err(0xff));
    }
}
