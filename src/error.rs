//! Module containing the universal error type
use crate::context::Type;
use thiserror::Error;

/// Universal error type for graph construction
///
/// Every variant is a programmer error: the expression graph is built by
/// trusted compiler code, so these indicate a bug in the caller rather than
/// bad user input.  The graph is left in an unspecified state after an error;
/// callers should propagate it rather than try to recover.
#[derive(Error, Debug)]
pub enum Error {
    #[error("node is not present in this `Context`")]
    BadNode,

    #[error("wrong number of inputs for {0}: got {1}")]
    WrongArity(&'static str, usize),

    #[error("constants must be built with `Context::int` or `Context::float`")]
    ExplicitConst,

    #[error("{0} requires a {1} input, got {2}")]
    WrongInputType(&'static str, Type, Type),

    #[error("{0} is not an iteration variable")]
    NotAVariable(&'static str),
}
