//! Expression-graph builder and optimizer for an image-processing JIT
//!
//! A [`Context`] owns a typed DAG of arithmetic over the four implicit
//! iteration variables `x`, `y`, `t`, and `c`, plus constants, memory loads,
//! and unbound placeholders.  Every builder call simultaneously performs
//! type inference and coercion, constant folding, algebraic strength
//! reduction, sum rebalancing, instruction fusion, and hash-consing, so the
//! node you get back is always the canonical form of the expression you
//! asked for.
//!
//! ```
//! use pixeljit::{Context, Opcode};
//!
//! let mut ctx = Context::new();
//! let x = ctx.x();
//! let y = ctx.y();
//!
//! // address arithmetic for a row-major pixel load at (x, y+1)
//! let row = ctx.add(y, 1).unwrap();
//! let addr = ctx.mul(row, 640).unwrap();
//! let addr = ctx.add(addr, x).unwrap();
//! let pix = ctx.load(addr).unwrap();
//!
//! // the row offset was folded into the load, and the stride multiply
//! // was hoisted clear of the x loop
//! let d = ctx.get(pix).unwrap();
//! assert_eq!(d.op, Opcode::LoadImm);
//! assert_eq!(d.ival, 640);
//! assert_eq!(ctx.print_exp(pix).unwrap(), "[((y*640)+x)+640]");
//! ```
//!
//! Register assignment and code emission live downstream of this crate;
//! they walk the graph through [`Context::iter`] and record their results
//! with [`Context::set_reg`].

pub mod context;
pub mod error;

pub use context::{Context, Deps, IntoNode, Node, NodeData, Opcode, Type};
pub use error::Error;
