// Lua 5.2 opcode set, reference numbering (lopcodes.h).

mod instruction;

pub use instruction::Instruction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadK,
    LoadKX,
    LoadBool,
    LoadNil,
    GetUpval,
    GetTabUp,
    GetTable,
    SetTabUp,
    SetUpval,
    SetTable,
    NewTable,
    SelfOp,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    Vararg,
    ExtraArg,
}

impl OpCode {
    pub fn from_u32(op: u32) -> Option<OpCode> {
        use OpCode::*;
        Some(match op {
            0 => Move,
            1 => LoadK,
            2 => LoadKX,
            3 => LoadBool,
            4 => LoadNil,
            5 => GetUpval,
            6 => GetTabUp,
            7 => GetTable,
            8 => SetTabUp,
            9 => SetUpval,
            10 => SetTable,
            11 => NewTable,
            12 => SelfOp,
            13 => Add,
            14 => Sub,
            15 => Mul,
            16 => Div,
            17 => Mod,
            18 => Pow,
            19 => Unm,
            20 => Not,
            21 => Len,
            22 => Concat,
            23 => Jmp,
            24 => Eq,
            25 => Lt,
            26 => Le,
            27 => Test,
            28 => TestSet,
            29 => Call,
            30 => TailCall,
            31 => Return,
            32 => ForLoop,
            33 => ForPrep,
            34 => TForCall,
            35 => TForLoop,
            36 => SetList,
            37 => Closure,
            38 => Vararg,
            39 => ExtraArg,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadK => "LOADK",
            LoadKX => "LOADKX",
            LoadBool => "LOADBOOL",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            GetTabUp => "GETTABUP",
            GetTable => "GETTABLE",
            SetTabUp => "SETTABUP",
            SetUpval => "SETUPVAL",
            SetTable => "SETTABLE",
            NewTable => "NEWTABLE",
            SelfOp => "SELF",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Pow => "POW",
            Unm => "UNM",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForCall => "TFORCALL",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Closure => "CLOSURE",
            Vararg => "VARARG",
            ExtraArg => "EXTRAARG",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
