use bitflags::bitflags;

/// The type of the value computed by a node
///
/// `Int` is a 32-bit signed integer and `Float` is a single-precision float,
/// matching what the code generator works with.  `Bool` values only appear as
/// comparison results and logical guards.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Type {
    Int,
    Float,
    Bool,
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int => write!(f, "Int"),
            Type::Float => write!(f, "Float"),
            Type::Bool => write!(f, "Bool"),
        }
    }
}

/// The operation performed by a node
///
/// Nodes should be constructed by calling the builder methods on
/// [`Context`](crate::context::Context); every opcode here except `Const`
/// can also be requested directly through
/// [`Context::make`](crate::context::Context::make).
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Opcode {
    Const,
    VarX,
    VarY,
    VarT,
    VarC,
    UnboundVar,

    Plus,
    Minus,
    Times,
    Divide,
    Power,
    Mod,

    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Exp,
    Log,
    Abs,
    Floor,
    Ceil,
    Round,

    Atan2,

    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,

    And,
    Nand,
    Or,

    IntToFloat,
    FloatToInt,

    PlusImm,
    TimesImm,
    LoadImm,
    Load,

    NoOp,
}

impl Opcode {
    /// Fixed name table used by the printers and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Const => "const",
            Opcode::VarX => "x",
            Opcode::VarY => "y",
            Opcode::VarT => "t",
            Opcode::VarC => "c",
            Opcode::UnboundVar => "unbound",
            Opcode::Plus => "add",
            Opcode::Minus => "sub",
            Opcode::Times => "mul",
            Opcode::Divide => "div",
            Opcode::Power => "pow",
            Opcode::Mod => "mod",
            Opcode::Sin => "sin",
            Opcode::Cos => "cos",
            Opcode::Tan => "tan",
            Opcode::Asin => "asin",
            Opcode::Acos => "acos",
            Opcode::Atan => "atan",
            Opcode::Exp => "exp",
            Opcode::Log => "log",
            Opcode::Abs => "abs",
            Opcode::Floor => "floor",
            Opcode::Ceil => "ceil",
            Opcode::Round => "round",
            Opcode::Atan2 => "atan2",
            Opcode::Lt => "lt",
            Opcode::Gt => "gt",
            Opcode::Lte => "lte",
            Opcode::Gte => "gte",
            Opcode::Eq => "eq",
            Opcode::Neq => "neq",
            Opcode::And => "and",
            Opcode::Nand => "nand",
            Opcode::Or => "or",
            Opcode::IntToFloat => "itof",
            Opcode::FloatToInt => "ftoi",
            Opcode::PlusImm => "addimm",
            Opcode::TimesImm => "mulimm",
            Opcode::LoadImm => "loadimm",
            Opcode::Load => "load",
            Opcode::NoOp => "nop",
        }
    }

    /// The dependency bit a node of this opcode contributes by itself,
    /// independent of its inputs
    ///
    /// `LoadImm` deliberately contributes nothing: it only ever reaches
    /// memory through the address it was fused from, and its dependence is
    /// whatever that address carries.
    pub(crate) fn self_deps(&self) -> Deps {
        match self {
            Opcode::VarX => Deps::X,
            Opcode::VarY => Deps::Y,
            Opcode::VarT => Deps::T,
            Opcode::VarC => Deps::C,
            Opcode::Load => Deps::MEM,
            Opcode::UnboundVar => Deps::UNBOUND,
            _ => Deps::empty(),
        }
    }

    pub(crate) fn is_implicit_var(&self) -> bool {
        matches!(
            self,
            Opcode::VarX | Opcode::VarY | Opcode::VarT | Opcode::VarC
        )
    }
}

bitflags! {
    /// Which implicit variables, memory, or unbound placeholders a node
    /// transitively depends on
    ///
    /// A node with an empty mask is a compile-time constant.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Deps: u8 {
        const X = 1 << 0;
        const Y = 1 << 1;
        const T = 1 << 2;
        const C = 1 << 3;
        const MEM = 1 << 4;
        const UNBOUND = 1 << 5;
    }
}

impl Deps {
    /// Variable dependency rank, used to decide which subexpressions can be
    /// hoisted out of the loop nest
    ///
    /// Lower is "more constant".  Channel and memory dependence share a rank:
    /// loads are sequenced with channel iteration, so a node that touches
    /// memory is innermost even if it mentions no iteration variable.
    /// Anything depending on an unbound placeholder ranks above every loop
    /// until a `bind` resolves it.
    pub fn level(self) -> u8 {
        if self.contains(Deps::UNBOUND) {
            99
        } else if self.intersects(Deps::C | Deps::MEM) {
            4
        } else if self.contains(Deps::X) {
            3
        } else if self.contains(Deps::Y) {
            2
        } else if self.contains(Deps::T) {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn level_ranking() {
        assert_eq!(Deps::empty().level(), 0);
        assert_eq!(Deps::T.level(), 1);
        assert_eq!(Deps::Y.level(), 2);
        assert_eq!((Deps::X | Deps::Y | Deps::T).level(), 3);
        assert_eq!(Deps::C.level(), 4);
        assert_eq!(Deps::MEM.level(), 4);
        assert_eq!((Deps::X | Deps::MEM).level(), 4);
        assert_eq!((Deps::X | Deps::UNBOUND).level(), 99);
    }

    #[test]
    fn self_deps() {
        assert_eq!(Opcode::VarX.self_deps(), Deps::X);
        assert_eq!(Opcode::Load.self_deps(), Deps::MEM);
        assert_eq!(Opcode::LoadImm.self_deps(), Deps::empty());
        assert_eq!(Opcode::UnboundVar.self_deps(), Deps::UNBOUND);
        assert_eq!(Opcode::Times.self_deps(), Deps::empty());
    }
}
