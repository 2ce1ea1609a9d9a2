//! The expression graph: a typed DAG of arithmetic over the implicit
//! iteration variables `x`, `y`, `t`, and `c`
//!
//! A [`Context`] owns every node and uniques constants, variables, and
//! whole subexpressions, so a [`Node`] handle identifies the canonical form
//! of an expression.  Construction goes through [`Context::make`] (or the
//! typed builder methods that wrap it), which runs a fixed rewrite pipeline:
//! type inference and coercion, constant folding, strength reduction, sum
//! rebalancing, instruction fusion, and common-subexpression elimination.
//!
//! The graph is append-only between collections: nodes are never mutated
//! after construction (except for their register slot, the transient GC
//! mark, and the append-only output list), and are only reclaimed in bulk
//! by [`Context::collect_garbage`] or [`Context::clear`].
mod indexed;
mod op;

use indexed::{define_index, Arena};
pub use op::{Deps, Opcode, Type};

use crate::error::Error;

use log::{debug, trace};
use ordered_float::OrderedFloat;
use std::collections::HashMap;
use std::fmt::Write;

define_index!(Node, "An index in the `Context` node store");

/// A single operation in the expression DAG
///
/// Every node has the same shape regardless of opcode; the uniform layout is
/// what lets one structural-equality check drive CSE for all operations.
/// `ival` holds the fused immediate of `PlusImm`/`TimesImm`/`LoadImm` and the
/// value of an integer constant; `fval` holds the value of a float constant.
#[derive(Debug)]
pub struct NodeData {
    pub ty: Type,
    pub op: Opcode,
    pub inputs: Vec<Node>,
    /// Back-edges to consumers.  Append-only; after a collection these may
    /// name freed parents, whose handles have gone stale and merely fail to
    /// resolve.
    pub outputs: Vec<Node>,
    pub ival: i32,
    pub fval: f32,
    pub deps: Deps,
    pub level: u8,
    /// Register assigned by the downstream allocator; `-1` until then
    pub reg: i32,
    pub width: u8,
    marked: bool,
}

/// A `Context` holds a set of deduplicated constants, variables, and
/// operations.
///
/// It should be used like an arena allocator: it grows over time, then frees
/// its contents in bulk through [`Context::collect_garbage`] or when dropped.
/// It is single-threaded by design; build one per compilation.
#[derive(Debug, Default)]
pub struct Context {
    nodes: Arena<NodeData, Node>,
    float_consts: HashMap<OrderedFloat<f32>, Node>,
    int_consts: HashMap<i32, Node>,
    vars: HashMap<Opcode, Node>,
}

impl Context {
    /// Build a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes every node and clears all uniquing tables
    ///
    /// All [`Node`] handles from this context are invalidated.  Intended for
    /// whole-graph tear-down between independent compilations.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.float_consts.clear();
        self.int_consts.clear();
        self.vars.clear();
    }

    /// Returns the number of live nodes in the context
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Checks whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node, returning `None` for a stale handle whose node has
    /// been collected
    ///
    /// Handles are only meaningful in the context that created them.
    pub fn get(&self, node: Node) -> Option<&NodeData> {
        self.nodes.get(node)
    }

    /// Iterates over every live node in index order
    ///
    /// This is the walk used by downstream register assignment and emission.
    pub fn iter(&self) -> impl Iterator<Item = (Node, &NodeData)> {
        self.nodes.iter()
    }

    /// Stores a register number for [`Context::print_inst`]; assignment
    /// policy lives outside this crate
    pub fn set_reg(&mut self, node: Node, reg: i32) -> Result<(), Error> {
        self.nodes.get_mut(node).ok_or(Error::BadNode)?.reg = reg;
        Ok(())
    }

    /// Checks whether the given [`Node`] is valid in this context
    fn check_node(&self, node: Node) -> Result<(), Error> {
        self.get(node).ok_or(Error::BadNode).map(|_| ())
    }

    fn data(&self, n: Node) -> &NodeData {
        self.nodes.get(n).expect("stale node handle")
    }

    fn data_mut(&mut self, n: Node) -> &mut NodeData {
        self.nodes.get_mut(n).expect("stale node handle")
    }

    fn ty(&self, n: Node) -> Type {
        self.data(n).ty
    }

    fn opcode(&self, n: Node) -> Opcode {
        self.data(n).op
    }

    fn level(&self, n: Node) -> u8 {
        self.data(n).level
    }

    fn input(&self, n: Node, i: usize) -> Node {
        self.data(n).inputs[i]
    }

    fn expect_arity(
        &self,
        op: Opcode,
        inputs: &[Node],
        want: usize,
    ) -> Result<(), Error> {
        if inputs.len() == want {
            Ok(())
        } else {
            Err(Error::WrongArity(op.name(), inputs.len()))
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Leaf constructors

    /// Returns the uniqued node for the given integer constant.
    /// ```
    /// # let mut ctx = pixeljit::Context::new();
    /// let a = ctx.int(3);
    /// assert_eq!(ctx.int(3), a);
    /// ```
    pub fn int(&mut self, v: i32) -> Node {
        if let Some(&n) = self.int_consts.get(&v) {
            return n;
        }
        let n = self.construct(Type::Int, Opcode::Const, vec![], v, 0.0);
        self.int_consts.insert(v, n);
        n
    }

    /// Returns the uniqued node for the given float constant.
    pub fn float(&mut self, v: f32) -> Node {
        if let Some(&n) = self.float_consts.get(&OrderedFloat(v)) {
            return n;
        }
        let n = self.construct(Type::Float, Opcode::Const, vec![], 0, v);
        self.float_consts.insert(OrderedFloat(v), n);
        n
    }

    /// Constructs or finds the horizontal iteration variable.
    /// ```
    /// # let mut ctx = pixeljit::Context::new();
    /// let x = ctx.x();
    /// assert_eq!(ctx.x(), x);
    /// ```
    pub fn x(&mut self) -> Node {
        self.var(Opcode::VarX)
    }

    /// Constructs or finds the vertical iteration variable
    pub fn y(&mut self) -> Node {
        self.var(Opcode::VarY)
    }

    /// Constructs or finds the frame iteration variable
    pub fn t(&mut self) -> Node {
        self.var(Opcode::VarT)
    }

    /// Constructs or finds the channel iteration variable
    pub fn c(&mut self) -> Node {
        self.var(Opcode::VarC)
    }

    fn var(&mut self, op: Opcode) -> Node {
        if let Some(&n) = self.vars.get(&op) {
            return n;
        }
        let n = self.construct(Type::Int, op, vec![], 0, 0.0);
        self.vars.insert(op, n);
        n
    }

    /// Allocates a fresh unbound placeholder
    ///
    /// Unlike every other leaf, placeholders are never uniqued or merged:
    /// their identity is the whole point, since [`Context::bind`] later
    /// replaces each one with a specific iteration variable.
    pub fn unbound(&mut self) -> Node {
        self.construct(Type::Int, Opcode::UnboundVar, vec![], 0, 0.0)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Typed builders

    fn op_unary<A: IntoNode>(&mut self, a: A, op: Opcode) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.make(op, &[a], 0, 0.0)
    }

    fn op_binary<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
        op: Opcode,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.make(op, &[a, b], 0, 0.0)
    }

    /// Builds an addition node
    /// ```
    /// # use pixeljit::{Context, Opcode};
    /// let mut ctx = Context::new();
    /// let x = ctx.x();
    /// let sum = ctx.add(x, 1).unwrap();
    /// assert_eq!(ctx.get(sum).unwrap().op, Opcode::Plus);
    /// ```
    pub fn add<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Plus)
    }

    /// Builds a subtraction node
    pub fn sub<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Minus)
    }

    /// Builds a multiplication node, with constant folding.
    /// ```
    /// # let mut ctx = pixeljit::Context::new();
    /// let n = ctx.mul(3, 4).unwrap();
    /// assert_eq!(n, ctx.int(12));
    /// ```
    pub fn mul<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Times)
    }

    /// Builds a division node; the result is always a float
    pub fn div<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Divide)
    }

    /// Builds an exponentiation node
    pub fn pow<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Power)
    }

    /// Builds a modulo node
    pub fn modulo<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Mod)
    }

    /// Builds a node computing `atan2(a, b)`
    pub fn atan2<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Atan2)
    }

    /// Builds a sine node (radians)
    pub fn sin<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Sin)
    }

    /// Builds a cosine node (radians)
    pub fn cos<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Cos)
    }

    /// Builds a tangent node (radians)
    pub fn tan<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Tan)
    }

    /// Builds an arcsine node
    pub fn asin<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Asin)
    }

    /// Builds an arccosine node
    pub fn acos<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Acos)
    }

    /// Builds an arctangent node
    pub fn atan<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Atan)
    }

    /// Builds a node computing `e^a`
    pub fn exp<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Exp)
    }

    /// Builds a natural-log node
    pub fn log<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Log)
    }

    /// Builds an absolute-value node; a boolean input passes through
    /// untouched
    pub fn abs<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Abs)
    }

    /// Builds a floor node; a non-float input passes through untouched
    pub fn floor<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Floor)
    }

    /// Builds a ceiling node; a non-float input passes through untouched
    pub fn ceil<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Ceil)
    }

    /// Builds a rounding node; a non-float input passes through untouched
    pub fn round<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::Round)
    }

    /// Builds an `a < b` comparison; comparisons always yield a boolean
    pub fn lt<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Lt)
    }

    /// Builds an `a > b` comparison
    pub fn gt<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Gt)
    }

    /// Builds an `a <= b` comparison
    pub fn lte<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Lte)
    }

    /// Builds an `a >= b` comparison
    pub fn gte<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Gte)
    }

    /// Builds an `a == b` comparison
    pub fn eq<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Eq)
    }

    /// Builds an `a != b` comparison
    pub fn neq<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Neq)
    }

    /// Builds a masking node: the value of `b` where the guard `a` holds,
    /// and a zero of `b`'s type elsewhere
    pub fn and<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::And)
    }

    /// Builds a masking node with an inverted guard
    pub fn nand<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Nand)
    }

    /// Builds an either-nonzero node; operands are promoted to a common type
    pub fn or<A: IntoNode, B: IntoNode>(&mut self, a: A, b: B) -> Result<Node, Error> {
        self.op_binary(a, b, Opcode::Or)
    }

    /// Builds an int-to-float cast; the input must be an integer
    pub fn int_to_float<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::IntToFloat)
    }

    /// Builds a float-to-int cast; the input must be a float
    pub fn float_to_int<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.op_unary(a, Opcode::FloatToInt)
    }

    /// Builds a memory load at the given address
    /// ```
    /// # use pixeljit::{Context, Opcode};
    /// let mut ctx = Context::new();
    /// let x = ctx.x();
    /// let addr = ctx.add(x, 7).unwrap();
    /// let pix = ctx.load(addr).unwrap();
    /// let d = ctx.get(pix).unwrap();
    /// assert_eq!(d.op, Opcode::LoadImm);
    /// assert_eq!(d.ival, 7);
    /// assert_eq!(d.inputs, [x]);
    /// ```
    pub fn load<A: IntoNode>(&mut self, addr: A) -> Result<Node, Error> {
        self.op_unary(addr, Opcode::Load)
    }

    /// Builds a memory load at `addr + offset`
    pub fn load_imm<A: IntoNode>(&mut self, addr: A, offset: i32) -> Result<Node, Error> {
        let addr = addr.into_node(self)?;
        self.make(Opcode::LoadImm, &[addr], offset, 0.0)
    }

    /// Builds a fused integer add-immediate
    pub fn plus_imm<A: IntoNode>(&mut self, a: A, k: i32) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.make(Opcode::PlusImm, &[a], k, 0.0)
    }

    /// Builds a fused integer multiply-immediate
    pub fn times_imm<A: IntoNode>(&mut self, a: A, k: i32) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.make(Opcode::TimesImm, &[a], k, 0.0)
    }

    ////////////////////////////////////////////////////////////////////////////
    // The factory

    /// Returns the canonical node for the requested operation on the given
    /// inputs
    ///
    /// This is the only way nodes enter the graph.  The returned node is not
    /// necessarily a fresh `op` node: the request may fold to a constant,
    /// reduce to one of its inputs, fuse into an immediate form, or resolve
    /// to an existing equivalent node.  `Const` cannot be requested here;
    /// use [`Context::int`] or [`Context::float`].
    pub fn make(
        &mut self,
        op: Opcode,
        inputs: &[Node],
        ival: i32,
        fval: f32,
    ) -> Result<Node, Error> {
        for &i in inputs {
            self.check_node(i)?;
        }
        let mut inputs = inputs.to_vec();

        // Type inference and coercion.  Everything downstream sees inputs
        // already upgraded to the result type.
        let ty = match op {
            Opcode::Const => return Err(Error::ExplicitConst),
            Opcode::NoOp => {
                self.expect_arity(op, &inputs, 1)?;
                self.ty(inputs[0])
            }
            Opcode::VarX
            | Opcode::VarY
            | Opcode::VarT
            | Opcode::VarC
            | Opcode::UnboundVar => {
                self.expect_arity(op, &inputs, 0)?;
                Type::Int
            }
            Opcode::Plus | Opcode::Minus | Opcode::Times | Opcode::Power | Opcode::Mod => {
                self.expect_arity(op, &inputs, 2)?;
                let t = if self.ty(inputs[0]) == Type::Float
                    || self.ty(inputs[1]) == Type::Float
                {
                    Type::Float
                } else {
                    Type::Int
                };
                inputs[0] = self.coerce(inputs[0], t)?;
                inputs[1] = self.coerce(inputs[1], t)?;
                t
            }
            Opcode::Divide | Opcode::Atan2 => {
                self.expect_arity(op, &inputs, 2)?;
                inputs[0] = self.coerce(inputs[0], Type::Float)?;
                inputs[1] = self.coerce(inputs[1], Type::Float)?;
                Type::Float
            }
            Opcode::Sin
            | Opcode::Cos
            | Opcode::Tan
            | Opcode::Asin
            | Opcode::Acos
            | Opcode::Atan
            | Opcode::Exp
            | Opcode::Log => {
                self.expect_arity(op, &inputs, 1)?;
                inputs[0] = self.coerce(inputs[0], Type::Float)?;
                Type::Float
            }
            Opcode::Abs => {
                self.expect_arity(op, &inputs, 1)?;
                // abs of a boolean is the boolean
                if self.ty(inputs[0]) == Type::Bool {
                    return Ok(inputs[0]);
                }
                self.ty(inputs[0])
            }
            Opcode::Floor | Opcode::Ceil | Opcode::Round => {
                self.expect_arity(op, &inputs, 1)?;
                // already integral; downstream passes rely on this identity
                if self.ty(inputs[0]) != Type::Float {
                    return Ok(inputs[0]);
                }
                Type::Float
            }
            Opcode::Lt | Opcode::Gt | Opcode::Lte | Opcode::Gte | Opcode::Eq
            | Opcode::Neq => {
                self.expect_arity(op, &inputs, 2)?;
                let t = if self.ty(inputs[0]) == Type::Float
                    || self.ty(inputs[1]) == Type::Float
                {
                    Type::Float
                } else {
                    Type::Int
                };
                inputs[0] = self.coerce(inputs[0], t)?;
                inputs[1] = self.coerce(inputs[1], t)?;
                Type::Bool
            }
            Opcode::And | Opcode::Nand => {
                self.expect_arity(op, &inputs, 2)?;
                inputs[0] = self.coerce(inputs[0], Type::Bool)?;
                self.ty(inputs[1])
            }
            Opcode::Or => {
                self.expect_arity(op, &inputs, 2)?;
                let (a, b) = (self.ty(inputs[0]), self.ty(inputs[1]));
                let t = if a == Type::Float || b == Type::Float {
                    Type::Float
                } else if a == Type::Int || b == Type::Int {
                    Type::Int
                } else {
                    Type::Bool
                };
                inputs[0] = self.coerce(inputs[0], t)?;
                inputs[1] = self.coerce(inputs[1], t)?;
                t
            }
            Opcode::IntToFloat => {
                self.expect_arity(op, &inputs, 1)?;
                let found = self.ty(inputs[0]);
                if found != Type::Int {
                    return Err(Error::WrongInputType(op.name(), Type::Int, found));
                }
                Type::Float
            }
            Opcode::FloatToInt => {
                self.expect_arity(op, &inputs, 1)?;
                let found = self.ty(inputs[0]);
                if found != Type::Float {
                    return Err(Error::WrongInputType(op.name(), Type::Float, found));
                }
                Type::Int
            }
            Opcode::PlusImm | Opcode::TimesImm => {
                self.expect_arity(op, &inputs, 1)?;
                Type::Int
            }
            Opcode::Load | Opcode::LoadImm => {
                self.expect_arity(op, &inputs, 1)?;
                inputs[0] = self.coerce(inputs[0], Type::Int)?;
                Type::Float
            }
        };

        // Constant folding.  An input with no dependencies counts as
        // constant; the fold reads its stored immediate fields.
        if !inputs.is_empty()
            && inputs.iter().all(|&i| self.data(i).deps.is_empty())
        {
            if let Some(n) = self.fold(op, ty, &inputs, ival) {
                return Ok(n);
            }
        }

        if op == Opcode::NoOp {
            return Ok(inputs[0]);
        }

        // x/y = x*(1/y) when the divisor is loop-invariant relative to the
        // dividend, pulling the reciprocal out of the inner loop
        if op == Opcode::Divide && self.level(inputs[1]) < self.level(inputs[0]) {
            let one = self.float(1.0);
            let recip = self.make(Opcode::Divide, &[one, inputs[1]], 0, 0.0)?;
            return self.make(Opcode::Times, &[inputs[0], recip], 0, 0.0);
        }

        if op == Opcode::Times {
            // (a+x)*b = x*b + a*b when a and b are both lower level than x,
            // hoisting a*b out of the loop over x
            let sum = if self.opcode(inputs[0]) == Opcode::Plus {
                Some((inputs[0], inputs[1]))
            } else if self.opcode(inputs[1]) == Opcode::Plus {
                Some((inputs[1], inputs[0]))
            } else {
                None
            };
            if let Some((sum, b)) = sum {
                let mut a = self.input(sum, 0);
                let mut x = self.input(sum, 1);
                if self.level(x) < self.level(a) {
                    std::mem::swap(&mut x, &mut a);
                }
                if self.level(x) > self.level(a) && self.level(x) > self.level(b) {
                    let xb = self.make(Opcode::Times, &[x, b], 0, 0.0)?;
                    let ab = self.make(Opcode::Times, &[a, b], 0, 0.0)?;
                    return self.make(Opcode::Plus, &[xb, ab], 0, 0.0);
                }
            }

            // (y+k)*b distributes the same way over the immediate
            if self.opcode(inputs[0]) == Opcode::PlusImm {
                trace!(
                    "distributing {} * {}",
                    self.exp_string(inputs[0]),
                    self.exp_string(inputs[1])
                );
                let y = self.input(inputs[0], 0);
                let k = self.data(inputs[0]).ival;
                let yb = self.make(Opcode::Times, &[y, inputs[1]], 0, 0.0)?;
                let kn = self.int(k);
                let bk = self.make(Opcode::Times, &[inputs[1], kn], 0, 0.0)?;
                return self.make(Opcode::Plus, &[yb, bk], 0, 0.0);
            }

            // (x*a)*b = x*(a*b) where a and b are more constant than x
            let prod = if self.opcode(inputs[0]) == Opcode::Times {
                Some((inputs[0], inputs[1]))
            } else if self.opcode(inputs[1]) == Opcode::Times {
                Some((inputs[1], inputs[0]))
            } else {
                None
            };
            if let Some((prod, b)) = prod {
                let mut x = self.input(prod, 0);
                let mut a = self.input(prod, 1);
                if self.level(x) < self.level(a) {
                    std::mem::swap(&mut x, &mut a);
                }
                if self.level(x) > self.level(a) && self.level(x) > self.level(b) {
                    let ab = self.make(Opcode::Times, &[a, b], 0, 0.0)?;
                    return self.make(Opcode::Times, &[x, ab], 0, 0.0);
                }
            }
        }

        // A non-additive consumer always sees its sums in canonical form
        if !matches!(op, Opcode::Plus | Opcode::Minus | Opcode::PlusImm) {
            for i in 0..inputs.len() {
                inputs[i] = self.rebalance_sum(inputs[i])?;
            }
        }

        // One unique instance of each implicit variable; unbound
        // placeholders are the opposite, a fresh identity per request
        if op.is_implicit_var() {
            return Ok(self.var(op));
        }
        if op == Opcode::UnboundVar {
            return Ok(self.unbound());
        }

        // Fuse a load of base plus constant into a load-with-offset
        if matches!(op, Opcode::Load | Opcode::LoadImm) {
            let addr = inputs[0];
            match self.opcode(addr) {
                Opcode::Plus => {
                    let l = self.input(addr, 0);
                    let r = self.input(addr, 1);
                    if self.opcode(l) == Opcode::Const {
                        let k = self.data(l).ival;
                        return self.make(
                            Opcode::LoadImm,
                            &[r],
                            k.wrapping_add(ival),
                            0.0,
                        );
                    } else if self.opcode(r) == Opcode::Const {
                        let k = self.data(r).ival;
                        return self.make(
                            Opcode::LoadImm,
                            &[l],
                            k.wrapping_add(ival),
                            0.0,
                        );
                    }
                }
                Opcode::Minus => {
                    let r = self.input(addr, 1);
                    if self.opcode(r) == Opcode::Const {
                        let l = self.input(addr, 0);
                        let k = self.data(r).ival;
                        return self.make(
                            Opcode::LoadImm,
                            &[l],
                            ival.wrapping_sub(k),
                            0.0,
                        );
                    }
                }
                Opcode::PlusImm => {
                    let base = self.input(addr, 0);
                    let k = self.data(addr).ival;
                    return self.make(
                        Opcode::LoadImm,
                        &[base],
                        k.wrapping_add(ival),
                        0.0,
                    );
                }
                _ => (),
            }
        }

        // An integer multiply by a constant becomes a multiply-immediate
        if op == Opcode::Times && ty == Type::Int {
            if self.opcode(inputs[0]) == Opcode::Const {
                let k = self.data(inputs[0]).ival;
                return self.make(Opcode::TimesImm, &[inputs[1]], k, 0.0);
            } else if self.opcode(inputs[1]) == Opcode::Const {
                let k = self.data(inputs[1]).ival;
                return self.make(Opcode::TimesImm, &[inputs[0]], k, 0.0);
            }
        }

        // Common subexpression elimination: any duplicate of this node must
        // already be a parent of our first input, so that one output list
        // is the only place we need to look
        if let Some(&first) = inputs.first() {
            for i in 0..self.data(first).outputs.len() {
                let candidate = self.data(first).outputs[i];
                // back-edges may dangle after a collection
                let Some(c) = self.nodes.get(candidate) else {
                    continue;
                };
                if c.op == op
                    && c.ty == ty
                    && c.ival == ival
                    && c.fval == fval
                    && c.inputs == inputs
                {
                    return Ok(candidate);
                }
            }
        }

        Ok(self.construct(ty, op, inputs, ival, fval))
    }

    /// Evaluates an operation whose inputs are all dependency-free, reading
    /// their stored immediates, and returns the uniqued constant result, or
    /// `None` if the opcode has no fold
    fn fold(&mut self, op: Opcode, ty: Type, inputs: &[Node], ival: i32) -> Option<Node> {
        let (i0, f0) = {
            let d = self.data(inputs[0]);
            (d.ival, d.fval)
        };
        let (i1, f1) = if inputs.len() > 1 {
            let d = self.data(inputs[1]);
            (d.ival, d.fval)
        } else {
            (0, 0.0)
        };
        let n = match op {
            Opcode::Plus => match ty {
                Type::Float => self.float(f0 + f1),
                _ => self.int(i0.wrapping_add(i1)),
            },
            Opcode::Minus => match ty {
                Type::Float => self.float(f0 - f1),
                _ => self.int(i0.wrapping_sub(i1)),
            },
            Opcode::Times => match ty {
                Type::Float => self.float(f0 * f1),
                _ => self.int(i0.wrapping_mul(i1)),
            },
            Opcode::PlusImm => self.int(i0.wrapping_add(ival)),
            Opcode::TimesImm => self.int(i0.wrapping_mul(ival)),
            Opcode::Divide => self.float(f0 / f1),
            Opcode::And => match ty {
                Type::Float => self.float(if i0 != 0 { f1 } else { 0.0 }),
                _ => self.int(if i0 != 0 { i1 } else { 0 }),
            },
            Opcode::Nand => match ty {
                Type::Float => self.float(if i0 == 0 { f1 } else { 0.0 }),
                _ => self.int(if i0 == 0 { i1 } else { 0 }),
            },
            Opcode::Or => match ty {
                // either-nonzero on floats folds as a sum
                Type::Float => self.float(f0 + f1),
                _ => self.int(i0 | i1),
            },
            Opcode::IntToFloat => self.float(i0 as f32),
            Opcode::FloatToInt => self.int(f0 as i32),
            _ => return None,
        };
        Some(n)
    }

    /// Allocates the node, wires dependency bits and back-edges, and
    /// registers it in the store
    fn construct(
        &mut self,
        ty: Type,
        op: Opcode,
        inputs: Vec<Node>,
        ival: i32,
        fval: f32,
    ) -> Node {
        let mut deps = op.self_deps();
        for &i in &inputs {
            deps |= self.data(i).deps;
        }
        let n = self.nodes.insert(NodeData {
            ty,
            op,
            inputs,
            outputs: vec![],
            ival,
            fval,
            deps,
            level: deps.level(),
            reg: -1,
            width: 1,
            marked: false,
        });
        for i in 0..self.data(n).inputs.len() {
            let input = self.data(n).inputs[i];
            self.data_mut(input).outputs.push(n);
        }
        n
    }

    ////////////////////////////////////////////////////////////////////////////
    // Coercion and bulk transforms

    /// Returns a node equivalent to `n` with the requested type
    ///
    /// Identity when the types already match.  Int and float convert through
    /// the cast opcodes; anything becomes a boolean by comparing against
    /// zero, and a boolean becomes numeric by masking a one.
    /// ```
    /// # use pixeljit::{Context, Opcode, Type};
    /// let mut ctx = Context::new();
    /// let x = ctx.x();
    /// let xf = ctx.coerce(x, Type::Float).unwrap();
    /// assert_eq!(ctx.get(xf).unwrap().op, Opcode::IntToFloat);
    /// assert_eq!(ctx.coerce(x, Type::Int).unwrap(), x);
    /// ```
    pub fn coerce(&mut self, n: Node, ty: Type) -> Result<Node, Error> {
        let from = self.get(n).ok_or(Error::BadNode)?.ty;
        if from == ty {
            return Ok(n);
        }
        match (from, ty) {
            (Type::Int, Type::Float) => self.make(Opcode::IntToFloat, &[n], 0, 0.0),
            (Type::Float, Type::Int) => self.make(Opcode::FloatToInt, &[n], 0, 0.0),
            (Type::Int, Type::Bool) => {
                let zero = self.int(0);
                self.make(Opcode::Neq, &[n, zero], 0, 0.0)
            }
            (Type::Float, Type::Bool) => {
                let zero = self.float(0.0);
                self.make(Opcode::Neq, &[n, zero], 0, 0.0)
            }
            (Type::Bool, Type::Int) => {
                let one = self.int(1);
                self.make(Opcode::And, &[n, one], 0, 0.0)
            }
            (Type::Bool, Type::Float) => {
                let one = self.float(1.0);
                self.make(Opcode::And, &[n, one], 0, 0.0)
            }
            _ => unreachable!("same-type coercion is handled above"),
        }
    }

    /// Returns a graph equivalent to `n` with every occurrence of the given
    /// implicit variable replaced by an integer constant
    ///
    /// Subtrees that do not depend on the variable are returned as-is, by
    /// the same handle, so sharing survives the substitution.
    /// ```
    /// # use pixeljit::{Context, Opcode};
    /// let mut ctx = Context::new();
    /// let x = ctx.x();
    /// let y = ctx.y();
    /// let e = ctx.add(x, y).unwrap();
    /// let e5 = ctx.substitute(e, Opcode::VarX, 5).unwrap();
    /// assert_ne!(e5, e);
    /// assert_eq!(ctx.substitute(y, Opcode::VarX, 5).unwrap(), y);
    /// ```
    pub fn substitute(&mut self, n: Node, var: Opcode, val: i32) -> Result<Node, Error> {
        let dep = match var {
            Opcode::VarX => Deps::X,
            Opcode::VarY => Deps::Y,
            Opcode::VarT => Deps::T,
            Opcode::VarC => Deps::C,
            _ => return Err(Error::NotAVariable(var.name())),
        };
        let d = self.get(n).ok_or(Error::BadNode)?;
        let (op, ival, fval, deps) = (d.op, d.ival, d.fval, d.deps);
        if op == var {
            return Ok(self.int(val));
        }
        if !deps.contains(dep) {
            return Ok(n);
        }
        let old = self.data(n).inputs.clone();
        let mut new_inputs = Vec::with_capacity(old.len());
        for i in old {
            new_inputs.push(self.substitute(i, var, val)?);
        }
        self.make(op, &new_inputs, ival, fval)
    }

    /// Replaces unbound placeholders with the implicit iteration variables
    ///
    /// Each placeholder that is reference-identical to `x`, `y`, `t`, or `c`
    /// becomes the corresponding variable.  The graph is rebuilt through
    /// [`Context::make`], so rewrites that were blocked by an unknown level
    /// get another chance to fire.  A node with no unbound dependence is
    /// returned untouched.
    pub fn bind(
        &mut self,
        n: Node,
        x: Node,
        y: Node,
        t: Node,
        c: Node,
    ) -> Result<Node, Error> {
        let d = self.get(n).ok_or(Error::BadNode)?;
        let (op, ival, fval, deps) = (d.op, d.ival, d.fval, d.deps);
        if !deps.contains(Deps::UNBOUND) {
            return Ok(n);
        }
        if n == x {
            return Ok(self.x());
        }
        if n == y {
            return Ok(self.y());
        }
        if n == t {
            return Ok(self.t());
        }
        if n == c {
            return Ok(self.c());
        }
        let old = self.data(n).inputs.clone();
        let mut new_inputs = Vec::with_capacity(old.len());
        for i in old {
            new_inputs.push(self.bind(i, x, y, t, c)?);
        }
        self.make(op, &new_inputs, ival, fval)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Sum rebalancing

    /// Normalizes a chain of `Plus`/`Minus`/`PlusImm` so the outermost
    /// operations involve the lowest-level terms
    ///
    /// Terms are gathered with their signs, sorted by ascending level, and
    /// rebuilt; constants are summed and placed innermost for a float sum,
    /// or outermost as an add-immediate for an int sum so that a later load
    /// can absorb them.  The canonical form is a fixed point: rebalancing
    /// it again returns the same node.  Anything that is not a sum is
    /// returned untouched.
    /// ```
    /// # use pixeljit::{Context, Opcode};
    /// let mut ctx = Context::new();
    /// let x = ctx.x();
    /// let inner = ctx.add(x, 2).unwrap();
    /// let sum = ctx.add(1, inner).unwrap();
    /// let canon = ctx.rebalance_sum(sum).unwrap();
    /// let d = ctx.get(canon).unwrap();
    /// assert_eq!(d.op, Opcode::PlusImm);
    /// assert_eq!(d.ival, 3);
    /// assert_eq!(d.inputs, [x]);
    /// ```
    pub fn rebalance_sum(&mut self, n: Node) -> Result<Node, Error> {
        let d = self.get(n).ok_or(Error::BadNode)?;
        if !matches!(d.op, Opcode::Plus | Opcode::Minus | Opcode::PlusImm) {
            return Ok(n);
        }
        let ty = d.ty;

        let mut terms = vec![];
        self.collect_sum(n, true, &mut terms);

        let (consts, mut rest): (Vec<_>, Vec<_>) = terms
            .into_iter()
            .partition(|&(t, _)| self.opcode(t) == Opcode::Const);
        rest.sort_by_key(|&(t, _)| self.level(t));

        // Only reachable if every term is a constant, which construction
        // folds away before a sum like that can exist; stay total anyway
        let Some(&(first, first_positive)) = rest.first() else {
            return Ok(self.fold_const_terms(ty, &consts));
        };

        let mut acc = first;
        let mut positive = first_positive;

        // A float sum carries its constant innermost, against the most
        // loop-invariant term
        if ty == Type::Float {
            let mut c = 0.0f32;
            for &(t, p) in &consts {
                let v = self.data(t).fval;
                if p {
                    c += v;
                } else {
                    c -= v;
                }
            }
            if c != 0.0 {
                let cn = self.float(c);
                if positive {
                    acc = self.make(Opcode::Plus, &[cn, acc], 0, 0.0)?;
                } else {
                    acc = self.make(Opcode::Minus, &[cn, acc], 0, 0.0)?;
                    positive = true;
                }
            }
        }

        for &(next, next_positive) in &rest[1..] {
            if positive == next_positive {
                acc = self.make(Opcode::Plus, &[acc, next], 0, 0.0)?;
            } else if positive {
                acc = self.make(Opcode::Minus, &[acc, next], 0, 0.0)?;
            } else {
                positive = true;
                acc = self.make(Opcode::Minus, &[next, acc], 0, 0.0)?;
            }
        }

        // An int sum carries its constant outermost as an immediate, where
        // a later load can absorb it
        if ty == Type::Int {
            let mut c = 0i32;
            for &(t, p) in &consts {
                let v = self.data(t).ival;
                if p {
                    c = c.wrapping_add(v);
                } else {
                    c = c.wrapping_sub(v);
                }
            }
            if c != 0 {
                if positive {
                    acc = self.make(Opcode::PlusImm, &[acc], c, 0.0)?;
                } else {
                    let cn = self.int(c);
                    acc = self.make(Opcode::Minus, &[cn, acc], 0, 0.0)?;
                }
            }
        }

        Ok(acc)
    }

    /// Gathers the terms of a sum spine with their signs, in order
    ///
    /// A `PlusImm` contributes its immediate as a positive constant term
    /// regardless of the sign it was reached under.
    fn collect_sum(&mut self, n: Node, positive: bool, terms: &mut Vec<(Node, bool)>) {
        match self.opcode(n) {
            Opcode::Plus => {
                let (a, b) = (self.input(n, 0), self.input(n, 1));
                self.collect_sum(a, positive, terms);
                self.collect_sum(b, positive, terms);
            }
            Opcode::Minus => {
                let (a, b) = (self.input(n, 0), self.input(n, 1));
                self.collect_sum(a, positive, terms);
                self.collect_sum(b, !positive, terms);
            }
            Opcode::PlusImm => {
                let a = self.input(n, 0);
                let k = self.data(n).ival;
                self.collect_sum(a, positive, terms);
                let c = self.int(k);
                terms.push((c, true));
            }
            _ => terms.push((n, positive)),
        }
    }

    fn fold_const_terms(&mut self, ty: Type, consts: &[(Node, bool)]) -> Node {
        match ty {
            Type::Float => {
                let mut c = 0.0f32;
                for &(t, p) in consts {
                    let v = self.data(t).fval;
                    if p {
                        c += v;
                    } else {
                        c -= v;
                    }
                }
                self.float(c)
            }
            _ => {
                let mut c = 0i32;
                for &(t, p) in consts {
                    let v = self.data(t).ival;
                    if p {
                        c = c.wrapping_add(v);
                    } else {
                        c = c.wrapping_sub(v);
                    }
                }
                self.int(c)
            }
        }
    }

    /// Runs the optimizations that only make sense once generation is
    /// complete; right now that is the final sum rebalancing at the root.
    /// ```
    /// # let mut ctx = pixeljit::Context::new();
    /// let x = ctx.x();
    /// let e = ctx.add(x, 0).unwrap();
    /// assert_eq!(ctx.optimize(e).unwrap(), x);
    /// ```
    pub fn optimize(&mut self, n: Node) -> Result<Node, Error> {
        self.rebalance_sum(n)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Reclamation

    /// Deletes every node that does not assist in the computation of the
    /// given roots
    ///
    /// Handles to surviving nodes stay valid; handles to collected nodes go
    /// stale, and [`Context::get`] on them returns `None`.  A recycled slot
    /// starts a new generation, so a stale handle never aliases a later
    /// node.
    /// ```
    /// # let mut ctx = pixeljit::Context::new();
    /// let x = ctx.x();
    /// let keep = ctx.add(x, 1).unwrap();
    /// let dead = ctx.mul(x, 5).unwrap();
    /// ctx.collect_garbage(&[keep]).unwrap();
    /// assert!(ctx.get(keep).is_some());
    /// assert!(ctx.get(dead).is_none());
    /// ```
    pub fn collect_garbage(&mut self, roots: &[Node]) -> Result<(), Error> {
        for &r in roots {
            self.check_node(r)?;
        }
        let before = self.nodes.len();

        // mark everything for death, then spare what the roots can reach
        for (_, d) in self.nodes.iter_mut() {
            d.marked = true;
        }
        for &r in roots {
            self.unmark(r);
        }
        self.nodes.retain(|_, d| !d.marked);

        // the uniquing tables may name freed nodes; rebuild them from the
        // survivors
        self.float_consts.clear();
        self.int_consts.clear();
        self.vars.clear();
        for (n, d) in self.nodes.iter() {
            match d.op {
                Opcode::Const => match d.ty {
                    Type::Float => {
                        self.float_consts.insert(OrderedFloat(d.fval), n);
                    }
                    _ => {
                        self.int_consts.insert(d.ival, n);
                    }
                },
                op if op.is_implicit_var() => {
                    self.vars.insert(op, n);
                }
                _ => (),
            }
        }
        debug!("collected {} of {} nodes", before - self.nodes.len(), before);
        Ok(())
    }

    fn unmark(&mut self, n: Node) {
        if !self.data(n).marked {
            return;
        }
        self.data_mut(n).marked = false;
        for i in 0..self.data(n).inputs.len() {
            let input = self.data(n).inputs[i];
            self.unmark(input);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Printing

    /// Renders the expression rooted at `n` in infix form
    pub fn print_exp(&self, n: Node) -> Result<String, Error> {
        self.check_node(n)?;
        Ok(self.exp_string(n))
    }

    fn exp_string(&self, n: Node) -> String {
        let mut out = String::new();
        self.write_exp(n, &mut out);
        out
    }

    fn write_exp(&self, n: Node, out: &mut String) {
        let d = self.data(n);
        match d.op {
            Opcode::Const => match d.ty {
                Type::Float => write!(out, "{:?}", d.fval).unwrap(),
                _ => write!(out, "{}", d.ival).unwrap(),
            },
            Opcode::VarX => out.push('x'),
            Opcode::VarY => out.push('y'),
            Opcode::VarT => out.push('t'),
            Opcode::VarC => out.push('c'),
            Opcode::UnboundVar => write!(out, "<{}>", n.get()).unwrap(),
            Opcode::Plus | Opcode::Minus | Opcode::Times | Opcode::Divide => {
                let sym = match d.op {
                    Opcode::Plus => '+',
                    Opcode::Minus => '-',
                    Opcode::Times => '*',
                    _ => '/',
                };
                out.push('(');
                self.write_exp(d.inputs[0], out);
                out.push(sym);
                self.write_exp(d.inputs[1], out);
                out.push(')');
            }
            Opcode::PlusImm | Opcode::TimesImm => {
                let sym = if d.op == Opcode::PlusImm { '+' } else { '*' };
                out.push('(');
                self.write_exp(d.inputs[0], out);
                write!(out, "{}{})", sym, d.ival).unwrap();
            }
            Opcode::LoadImm => {
                out.push('[');
                self.write_exp(d.inputs[0], out);
                write!(out, "+{}]", d.ival).unwrap();
            }
            Opcode::Load => {
                out.push('[');
                self.write_exp(d.inputs[0], out);
                out.push(']');
            }
            _ => {
                if d.inputs.is_empty() {
                    out.push_str(d.op.name());
                } else {
                    write!(out, "{}(", d.op.name()).unwrap();
                    for (i, &input) in d.inputs.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        self.write_exp(input, out);
                    }
                    out.push(')');
                }
            }
        }
    }

    /// Renders `n` as a single instruction, `dest = op operands`
    ///
    /// Registers below 16 print as `r{n}`, the rest as `xmm{n-16}`; an
    /// operand with no register yet prints its immediate value.
    pub fn print_inst(&self, n: Node) -> Result<String, Error> {
        let d = self.get(n).ok_or(Error::BadNode)?;
        let mut out = String::new();
        if d.reg < 16 {
            write!(out, "r{} = ", d.reg).unwrap();
        } else {
            write!(out, "xmm{} = ", d.reg - 16).unwrap();
        }
        let args: Vec<String> = d.inputs.iter().map(|&i| self.operand(i)).collect();
        match d.op {
            Opcode::Const => match d.ty {
                Type::Float => write!(out, "{:?}", d.fval).unwrap(),
                _ => write!(out, "{}", d.ival).unwrap(),
            },
            Opcode::Plus => write!(out, "{} + {}", args[0], args[1]).unwrap(),
            Opcode::Minus => write!(out, "{} - {}", args[0], args[1]).unwrap(),
            Opcode::Times => write!(out, "{} * {}", args[0], args[1]).unwrap(),
            Opcode::Divide => write!(out, "{} / {}", args[0], args[1]).unwrap(),
            Opcode::PlusImm => write!(out, "{} + {}", args[0], d.ival).unwrap(),
            Opcode::TimesImm => write!(out, "{} * {}", args[0], d.ival).unwrap(),
            Opcode::LoadImm => write!(out, "load {} + {}", args[0], d.ival).unwrap(),
            _ => {
                out.push_str(d.op.name());
                for a in &args {
                    write!(out, " {}", a).unwrap();
                }
            }
        }
        Ok(out)
    }

    fn operand(&self, n: Node) -> String {
        let d = self.data(n);
        if d.reg < 0 {
            match d.ty {
                Type::Float => format!("{:?}", d.fval),
                _ => format!("{}", d.ival),
            }
        } else if d.reg < 16 {
            format!("r{}", d.reg)
        } else {
            format!("xmm{}", d.reg - 16)
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
/// Helper trait for things that can be converted into a [`Node`] given a
/// [`Context`].
///
/// This trait allows you to write
/// ```
/// # let mut ctx = pixeljit::Context::new();
/// let x = ctx.x();
/// let sum = ctx.add(x, 1).unwrap();
/// ```
/// instead of the more verbose
/// ```
/// # let mut ctx = pixeljit::Context::new();
/// let x = ctx.x();
/// let num = ctx.int(1);
/// let sum = ctx.add(x, num).unwrap();
/// ```
pub trait IntoNode {
    /// Converts the given value into a node
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error>;
}

impl IntoNode for Node {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        ctx.check_node(self)?;
        Ok(self)
    }
}

impl IntoNode for i32 {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        Ok(ctx.int(self))
    }
}

impl IntoNode for f32 {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        Ok(ctx.float(self))
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn const_uniquing() {
        let mut ctx = Context::new();
        let a = ctx.int(3);
        assert_eq!(ctx.int(3), a);
        let f = ctx.float(2.5);
        assert_eq!(ctx.float(2.5), f);
        assert_ne!(a, f);

        let d = ctx.get(a).unwrap();
        assert_eq!((d.op, d.ty, d.ival), (Opcode::Const, Type::Int, 3));
        let d = ctx.get(f).unwrap();
        assert_eq!((d.op, d.ty, d.fval), (Opcode::Const, Type::Float, 2.5));
    }

    #[test]
    fn var_uniquing_and_unbound_freshness() {
        let mut ctx = Context::new();
        assert_eq!(ctx.x(), ctx.x());
        assert_eq!(ctx.y(), ctx.y());
        assert_eq!(ctx.t(), ctx.t());
        assert_eq!(ctx.c(), ctx.c());
        assert_ne!(ctx.x(), ctx.y());

        // requesting a variable through the factory hits the same instance
        let x = ctx.x();
        assert_eq!(ctx.make(Opcode::VarX, &[], 0, 0.0).unwrap(), x);

        let u = ctx.unbound();
        assert_ne!(ctx.unbound(), u);
        assert_ne!(ctx.make(Opcode::UnboundVar, &[], 0, 0.0).unwrap(), u);
        assert_eq!(ctx.get(u).unwrap().level, 99);
    }

    #[test]
    fn back_edges_and_deps() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let t = ctx.t();
        let p = ctx.mul(x, y).unwrap();
        let q = ctx.add(p, t).unwrap();

        let dp = ctx.get(p).unwrap();
        assert_eq!(dp.op, Opcode::Times);
        assert_eq!(dp.deps, Deps::X | Deps::Y);
        assert_eq!(dp.level, 3);
        assert!(dp.outputs.contains(&q));
        assert!(ctx.get(x).unwrap().outputs.contains(&p));
        assert!(ctx.get(y).unwrap().outputs.contains(&p));

        let dq = ctx.get(q).unwrap();
        assert_eq!(dq.deps, Deps::X | Deps::Y | Deps::T);
        assert_eq!(dq.level, 3);
        assert_eq!(dq.inputs, [p, t]);

        // loads pick up the memory bit and rank innermost
        let ld = ctx.load(x).unwrap();
        let dl = ctx.get(ld).unwrap();
        assert_eq!(dl.op, Opcode::Load);
        assert_eq!(dl.deps, Deps::X | Deps::MEM);
        assert_eq!(dl.level, 4);
    }

    #[test]
    fn cse_returns_existing() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let a = ctx.add(x, y).unwrap();
        let b = ctx.add(x, y).unwrap();
        assert_eq!(a, b);

        // operand order is part of the signature
        let c = ctx.add(y, x).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn folding() {
        let mut ctx = Context::new();
        let n = ctx.mul(3, 4).unwrap();
        assert_eq!(n, ctx.int(12));
        assert_eq!(ctx.get(n).unwrap().op, Opcode::Const);

        let s = ctx.add(1.5f32, 2.25f32).unwrap();
        assert_eq!(s, ctx.float(3.75));

        let m = ctx.sub(7, 3).unwrap();
        assert_eq!(m, ctx.int(4));

        let q = ctx.div(1.0f32, 4.0f32).unwrap();
        assert_eq!(q, ctx.float(0.25));

        let f = ctx.int_to_float(7).unwrap();
        assert_eq!(f, ctx.float(7.0));

        let c = ctx.float(2.5);
        let i = ctx.float_to_int(c).unwrap();
        assert_eq!(i, ctx.int(2));

        let o = ctx.or(5, 3).unwrap();
        assert_eq!(o, ctx.int(7));

        let p = ctx.plus_imm(5, 3).unwrap();
        assert_eq!(p, ctx.int(8));

        let t = ctx.times_imm(5, 3).unwrap();
        assert_eq!(t, ctx.int(15));

        // mixed int/float addition promotes, then folds as floats
        let mixed = ctx.add(1, 0.5f32).unwrap();
        assert_eq!(mixed, ctx.float(1.5));
    }

    #[test]
    fn fold_dominates_construct() {
        let mut ctx = Context::new();
        // no fold is defined for sin, so this stays symbolic despite having
        // no dependencies at all
        let s = ctx.sin(2.0f32).unwrap();
        let d = ctx.get(s).unwrap();
        assert_eq!(d.op, Opcode::Sin);
        assert_eq!(d.deps, Deps::empty());
        assert_eq!(d.level, 0);

        // but a dependency-free input counts as constant, so any foldable
        // consumer folds it
        let e = ctx.add(s, 1.0f32).unwrap();
        assert_eq!(ctx.get(e).unwrap().op, Opcode::Const);
    }

    #[test]
    fn noop_elision() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let e = ctx.add(x, y).unwrap();
        assert_eq!(ctx.make(Opcode::NoOp, &[e], 0, 0.0).unwrap(), e);
    }

    #[test]
    fn abs_and_round_identities() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();

        let b = ctx.lt(x, y).unwrap();
        assert_eq!(ctx.get(b).unwrap().ty, Type::Bool);
        assert_eq!(ctx.abs(b).unwrap(), b);

        assert_eq!(ctx.floor(x).unwrap(), x);
        assert_eq!(ctx.ceil(x).unwrap(), x);
        assert_eq!(ctx.round(x).unwrap(), x);

        let xf = ctx.coerce(x, Type::Float).unwrap();
        let fl = ctx.floor(xf).unwrap();
        assert_eq!(ctx.get(fl).unwrap().op, Opcode::Floor);
        let af = ctx.abs(xf).unwrap();
        assert_eq!(ctx.get(af).unwrap().ty, Type::Float);
    }

    #[test]
    fn divide_hoists_invariant_divisor() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let d = ctx.div(x, y).unwrap();

        let dd = ctx.get(d).unwrap();
        assert_eq!(dd.op, Opcode::Times);
        let lhs = ctx.get(dd.inputs[0]).unwrap();
        assert_eq!(lhs.op, Opcode::IntToFloat);
        let rhs = ctx.get(dd.inputs[1]).unwrap();
        assert_eq!(rhs.op, Opcode::Divide);
        assert_eq!(ctx.get(rhs.inputs[0]).unwrap().fval, 1.0);
        // the reciprocal only depends on y, so it can be hoisted a level out
        assert_eq!(rhs.level, 2);

        // no hoist when the divisor is the higher-level side
        let e = ctx.div(y, x).unwrap();
        assert_eq!(ctx.get(e).unwrap().op, Opcode::Divide);
    }

    #[test]
    fn distribute_times_over_plus() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let sum = ctx.add(x, y).unwrap();
        let e = ctx.mul(sum, 3).unwrap();

        let d = ctx.get(e).unwrap();
        assert_eq!(d.op, Opcode::Plus);
        let l = ctx.get(d.inputs[0]).unwrap();
        assert_eq!((l.op, l.ival), (Opcode::TimesImm, 3));
        assert_eq!(l.inputs, [x]);
        let r = ctx.get(d.inputs[1]).unwrap();
        assert_eq!((r.op, r.ival), (Opcode::TimesImm, 3));
        assert_eq!(r.inputs, [y]);
    }

    #[test]
    fn distribute_declined_when_no_hoist() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let t = ctx.t();
        // (y+t)*x gains nothing from distribution: x is the highest level
        let yt = ctx.add(y, t).unwrap();
        let e = ctx.mul(yt, x).unwrap();

        let d = ctx.get(e).unwrap();
        assert_eq!(d.op, Opcode::Times);
        // but the multiply did canonicalize its sum child: t before y
        let s = ctx.get(d.inputs[0]).unwrap();
        assert_eq!(s.op, Opcode::Plus);
        assert_eq!(s.inputs, [t, y]);
        assert_eq!(d.inputs[1], x);
    }

    #[test]
    fn reassociate_products_inward() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let t = ctx.t();
        // (x*y)*t: x stays outermost, y*t moves inward as a unit
        let xy = ctx.mul(x, y).unwrap();
        let e = ctx.mul(xy, t).unwrap();

        let d = ctx.get(e).unwrap();
        assert_eq!(d.op, Opcode::Times);
        assert_eq!(d.inputs[0], x);
        let inner = ctx.get(d.inputs[1]).unwrap();
        assert_eq!(inner.op, Opcode::Times);
        assert_eq!(inner.inputs, [y, t]);
    }

    #[test]
    fn times_imm_fusion() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let a = ctx.mul(x, 3).unwrap();
        let b = ctx.mul(3, x).unwrap();
        assert_eq!(a, b);
        let d = ctx.get(a).unwrap();
        assert_eq!((d.op, d.ival), (Opcode::TimesImm, 3));
        assert_eq!(d.inputs, [x]);

        // float multiplies keep the constant as a real operand
        let xf = ctx.coerce(x, Type::Float).unwrap();
        let f = ctx.mul(xf, 3.0f32).unwrap();
        assert_eq!(ctx.get(f).unwrap().op, Opcode::Times);
    }

    #[test]
    fn load_fusion() {
        let mut ctx = Context::new();
        let x = ctx.x();

        let a1 = ctx.add(x, 7).unwrap();
        let l1 = ctx.load(a1).unwrap();
        let d1 = ctx.get(l1).unwrap();
        assert_eq!((d1.op, d1.ival), (Opcode::LoadImm, 7));
        assert_eq!(d1.inputs, [x]);

        // subtracted offsets fuse negatively
        let a2 = ctx.sub(x, 3).unwrap();
        let l2 = ctx.load(a2).unwrap();
        let d2 = ctx.get(l2).unwrap();
        assert_eq!((d2.op, d2.ival), (Opcode::LoadImm, -3));
        assert_eq!(d2.inputs, [x]);

        // an explicit load offset combines with the address offset
        let l3 = ctx.load_imm(a1, 10).unwrap();
        assert_eq!(ctx.get(l3).unwrap().ival, 17);

        // the fused load is CSE'd like anything else
        assert_eq!(ctx.load(a1).unwrap(), l1);

        // a plain variable address stays a plain load
        let l4 = ctx.load(x).unwrap();
        assert_eq!(ctx.get(l4).unwrap().op, Opcode::Load);
    }

    #[test]
    fn rebalance_canonicalizes_int_sum() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let s1 = ctx.add(x, y).unwrap();
        let s2 = ctx.add(s1, 5).unwrap();
        let r = ctx.rebalance_sum(s2).unwrap();

        let d = ctx.get(r).unwrap();
        assert_eq!((d.op, d.ival), (Opcode::PlusImm, 5));
        let inner = ctx.get(d.inputs[0]).unwrap();
        assert_eq!(inner.op, Opcode::Plus);
        assert_eq!(inner.inputs, [y, x]);

        assert_eq!(ctx.rebalance_sum(r).unwrap(), r);
    }

    #[test]
    fn rebalance_float_const_innermost() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let xf = ctx.coerce(x, Type::Float).unwrap();
        let yf = ctx.coerce(y, Type::Float).unwrap();

        let e1 = ctx.add(xf, 1.5f32).unwrap();
        let e2 = ctx.add(e1, yf).unwrap();
        let r = ctx.rebalance_sum(e2).unwrap();

        let d = ctx.get(r).unwrap();
        assert_eq!(d.op, Opcode::Plus);
        let inner = ctx.get(d.inputs[0]).unwrap();
        assert_eq!(inner.op, Opcode::Plus);
        assert_eq!(ctx.get(inner.inputs[0]).unwrap().fval, 1.5);
        assert_eq!(inner.inputs[1], yf);
        assert_eq!(d.inputs[1], xf);

        assert_eq!(ctx.rebalance_sum(r).unwrap(), r);
    }

    #[test]
    fn rebalance_negative_accumulator() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let xf = ctx.coerce(x, Type::Float).unwrap();
        let yf = ctx.coerce(y, Type::Float).unwrap();

        // x - (y + 3) collects as +x, -y, -3
        let inner = ctx.add(yf, 3.0f32).unwrap();
        let e = ctx.sub(xf, inner).unwrap();
        let r = ctx.rebalance_sum(e).unwrap();

        // canonical form is ((-3 - y) + x)
        let d = ctx.get(r).unwrap();
        assert_eq!(d.op, Opcode::Plus);
        let m = ctx.get(d.inputs[0]).unwrap();
        assert_eq!(m.op, Opcode::Minus);
        assert_eq!(ctx.get(m.inputs[0]).unwrap().fval, -3.0);
        assert_eq!(m.inputs[1], yf);
        assert_eq!(d.inputs[1], xf);

        assert_eq!(ctx.rebalance_sum(r).unwrap(), r);
    }

    #[test]
    fn rebalance_negative_int_sum() {
        let mut ctx = Context::new();
        let x = ctx.x();
        // 5 - x has a lone negative term, so the constant stays a real node
        let e = ctx.sub(5, x).unwrap();
        let r = ctx.rebalance_sum(e).unwrap();
        assert_eq!(r, e);
        let d = ctx.get(r).unwrap();
        assert_eq!(d.op, Opcode::Minus);
        assert_eq!(ctx.get(d.inputs[0]).unwrap().ival, 5);
    }

    #[test]
    fn optimize_drops_vanishing_terms() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let e = ctx.add(x, 0).unwrap();
        assert_eq!(ctx.get(e).unwrap().op, Opcode::Plus);
        assert_eq!(ctx.optimize(e).unwrap(), x);

        // terms that cancel disappear too
        let f = ctx.add(x, 5).unwrap();
        let g = ctx.sub(f, 5).unwrap();
        assert_eq!(ctx.optimize(g).unwrap(), x);
    }

    #[test]
    fn substitute_shares_and_rebuilds() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let e = ctx.add(x, y).unwrap();

        let c5 = ctx.int(5);
        let s = ctx.substitute(e, Opcode::VarX, 5).unwrap();
        let d = ctx.get(s).unwrap();
        assert_eq!(d.op, Opcode::Plus);
        assert_eq!(d.inputs, [c5, y]);

        // untouched graphs come back by identity
        assert_eq!(ctx.substitute(y, Opcode::VarX, 5).unwrap(), y);
        assert_eq!(ctx.substitute(e, Opcode::VarC, 9).unwrap(), e);

        // substituting the variable itself yields the constant
        assert_eq!(ctx.substitute(x, Opcode::VarX, 9).unwrap(), ctx.int(9));

        assert!(matches!(
            ctx.substitute(e, Opcode::Plus, 1),
            Err(Error::NotAVariable(_))
        ));
    }

    #[test]
    fn bind_replaces_by_identity() {
        let mut ctx = Context::new();
        let u1 = ctx.unbound();
        let u2 = ctx.unbound();
        let u3 = ctx.unbound();
        let u4 = ctx.unbound();

        let prod = ctx.mul(u1, u2).unwrap();
        let e = ctx.add(prod, u3).unwrap();
        assert_eq!(ctx.get(e).unwrap().level, 99);

        let bound = ctx.bind(e, u1, u2, u3, u4).unwrap();
        let x = ctx.x();
        let y = ctx.y();
        let t = ctx.t();
        let d = ctx.get(bound).unwrap();
        assert_eq!(d.op, Opcode::Plus);
        assert_eq!(d.deps, Deps::X | Deps::Y | Deps::T);
        assert_eq!(d.level, 3);

        let dp = ctx.get(d.inputs[0]).unwrap();
        assert_eq!(dp.op, Opcode::Times);
        assert_eq!(dp.inputs, [x, y]);
        assert_eq!(d.inputs[1], t);

        // nothing unbound, nothing to do
        let clean = ctx.add(x, y).unwrap();
        assert_eq!(ctx.bind(clean, u1, u2, u3, u4).unwrap(), clean);
    }

    #[test]
    fn coerce_rules() {
        let mut ctx = Context::new();
        let x = ctx.x();

        let xf = ctx.coerce(x, Type::Float).unwrap();
        assert_eq!(ctx.get(xf).unwrap().op, Opcode::IntToFloat);
        assert_eq!(ctx.coerce(x, Type::Int).unwrap(), x);

        // casting a constant folds immediately
        let c = ctx.float(2.5);
        assert_eq!(ctx.coerce(c, Type::Int).unwrap(), ctx.int(2));

        // anything to bool is a compare against zero
        let b = ctx.coerce(x, Type::Bool).unwrap();
        let db = ctx.get(b).unwrap();
        assert_eq!((db.op, db.ty), (Opcode::Neq, Type::Bool));

        // bool to numeric masks a one
        let i = ctx.coerce(b, Type::Int).unwrap();
        let di = ctx.get(i).unwrap();
        assert_eq!((di.op, di.ty), (Opcode::And, Type::Int));
    }

    #[test]
    fn masking_and_promotion_types() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let xf = ctx.coerce(x, Type::Float).unwrap();

        // the masked value decides the result type
        let g = ctx.lt(x, y).unwrap();
        let masked = ctx.and(g, xf).unwrap();
        assert_eq!(ctx.get(masked).unwrap().ty, Type::Float);
        let inv = ctx.nand(g, x).unwrap();
        assert_eq!(ctx.get(inv).unwrap().ty, Type::Int);

        // a non-bool guard is coerced
        let m = ctx.and(x, y).unwrap();
        let dm = ctx.get(m).unwrap();
        assert_eq!(ctx.get(dm.inputs[0]).unwrap().op, Opcode::Neq);

        // or promotes to the widest operand type
        let o = ctx.or(x, 1.5f32).unwrap();
        let d = ctx.get(o).unwrap();
        assert_eq!((d.op, d.ty), (Opcode::Or, Type::Float));
    }

    #[test]
    fn collect_garbage_soundness() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let keep = ctx.add(x, 1).unwrap();
        let dead = ctx.mul(x, 2.0f32).unwrap();
        assert_eq!(ctx.len(), 6);

        ctx.collect_garbage(&[keep]).unwrap();
        assert_eq!(ctx.len(), 3);
        assert!(ctx.get(dead).is_none());
        assert!(ctx.get(keep).is_some());
        assert!(ctx.get(x).is_some());

        // surviving constants stay uniqued
        let c1 = ctx.int(1);
        assert_eq!(ctx.get(keep).unwrap().inputs[1], c1);
        assert_eq!(ctx.len(), 3);

        // collected constants are rebuilt fresh on demand
        let c2 = ctx.float(2.0);
        assert_eq!(ctx.len(), 4);
        assert_eq!(ctx.get(c2).unwrap().fval, 2.0);

        // and the canonical x survived the table rebuild
        assert_eq!(ctx.x(), x);

        // a stale handle is not a usable root
        assert!(matches!(
            ctx.collect_garbage(&[dead]),
            Err(Error::BadNode)
        ));
    }

    #[test]
    fn clear_tears_down_everything() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let e = ctx.add(x, 1).unwrap();
        ctx.clear();
        assert!(ctx.is_empty());
        assert!(ctx.get(x).is_none());
        assert!(ctx.get(e).is_none());
    }

    #[test]
    fn factory_errors() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let xf = ctx.coerce(x, Type::Float).unwrap();

        assert!(matches!(
            ctx.make(Opcode::Const, &[], 3, 0.0),
            Err(Error::ExplicitConst)
        ));
        assert!(matches!(
            ctx.make(Opcode::Plus, &[x], 0, 0.0),
            Err(Error::WrongArity(_, 1))
        ));
        assert!(matches!(
            ctx.make(Opcode::Sin, &[x, x], 0, 0.0),
            Err(Error::WrongArity(_, 2))
        ));
        assert!(matches!(
            ctx.make(Opcode::IntToFloat, &[xf], 0, 0.0),
            Err(Error::WrongInputType(..))
        ));
        assert!(matches!(
            ctx.make(Opcode::FloatToInt, &[x], 0, 0.0),
            Err(Error::WrongInputType(..))
        ));

        // handles from another (or no) context are rejected
        let mut empty = Context::new();
        assert!(matches!(
            empty.make(Opcode::Plus, &[x, x], 0, 0.0),
            Err(Error::BadNode)
        ));
    }

    #[test]
    fn print_exp_forms() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();

        let e = ctx.add(x, 2).unwrap();
        assert_eq!(ctx.print_exp(e).unwrap(), "(x+2)");

        let m = ctx.sub(x, y).unwrap();
        assert_eq!(ctx.print_exp(m).unwrap(), "(x-y)");

        let ti = ctx.mul(x, 3).unwrap();
        assert_eq!(ctx.print_exp(ti).unwrap(), "(x*3)");

        let a = ctx.add(x, 7).unwrap();
        let l = ctx.load(a).unwrap();
        assert_eq!(ctx.print_exp(l).unwrap(), "[x+7]");

        let plain = ctx.load(x).unwrap();
        assert_eq!(ctx.print_exp(plain).unwrap(), "[x]");

        let s = ctx.sin(x).unwrap();
        assert_eq!(ctx.print_exp(s).unwrap(), "sin(itof(x))");

        let f = ctx.float(1.5);
        assert_eq!(ctx.print_exp(f).unwrap(), "1.5");

        let u = ctx.unbound();
        assert_eq!(ctx.print_exp(u).unwrap(), format!("<{}>", u.get()));
    }

    #[test]
    fn print_inst_forms() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let ti = ctx.mul(x, 3).unwrap();
        ctx.set_reg(x, 0).unwrap();
        ctx.set_reg(ti, 1).unwrap();
        assert_eq!(ctx.print_inst(ti).unwrap(), "r1 = r0 * 3");

        // a register-less constant operand prints as its immediate
        let e = ctx.add(x, 2).unwrap();
        ctx.set_reg(e, 2).unwrap();
        assert_eq!(ctx.print_inst(e).unwrap(), "r2 = r0 + 2");

        // registers 16 and up are the vector file
        let xf = ctx.coerce(x, Type::Float).unwrap();
        ctx.set_reg(xf, 16).unwrap();
        assert_eq!(ctx.print_inst(xf).unwrap(), "xmm0 = itof r0");

        let a = ctx.add(x, 7).unwrap();
        let l = ctx.load(a).unwrap();
        ctx.set_reg(l, 17).unwrap();
        assert_eq!(ctx.print_inst(l).unwrap(), "xmm1 = load r0 + 7");
    }
}
