//! Interceptors wrap executor operations. No dynamic proxies: each
//! extension declares the points it intercepts, and invocations travel as
//! typed values with an explicit `proceed` continuation.

use std::sync::Arc;

use ahash::AHashMap;
use squill_core::Value;
use squill_core::errors::Result;

use crate::executor::BatchResult;
use crate::mapping::MappedStatement;
use crate::session::RowBounds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptPoint {
    ExecutorQuery,
    ExecutorUpdate,
    ExecutorFlush,
    ExecutorCommit,
    ExecutorRollback,
}

/// One intercepted call: the target operation with its (mutable)
/// arguments. Pass it to `proceed` to continue down the chain.
pub enum Invocation<'a> {
    Query {
        statement: &'a Arc<MappedStatement>,
        parameter: &'a mut Value,
        bounds: &'a mut RowBounds,
    },
    Update {
        statement: &'a Arc<MappedStatement>,
        parameter: &'a mut Value,
    },
    Flush,
    Commit {
        required: bool,
    },
    Rollback {
        required: bool,
    },
}

impl Invocation<'_> {
    pub fn point(&self) -> InterceptPoint {
        match self {
            Invocation::Query { .. } => InterceptPoint::ExecutorQuery,
            Invocation::Update { .. } => InterceptPoint::ExecutorUpdate,
            Invocation::Flush => InterceptPoint::ExecutorFlush,
            Invocation::Commit { .. } => InterceptPoint::ExecutorCommit,
            Invocation::Rollback { .. } => InterceptPoint::ExecutorRollback,
        }
    }

    pub fn statement_id(&self) -> Option<&str> {
        match self {
            Invocation::Query { statement, .. } | Invocation::Update { statement, .. } => {
                Some(&statement.id)
            }
            _ => None,
        }
    }
}

/// What an intercepted operation produced.
#[derive(Debug)]
pub enum Outcome {
    Rows(Vec<Value>),
    Affected(u64),
    Batches(Vec<BatchResult>),
    Unit,
}

pub type Proceed<'p> = dyn FnMut(Invocation<'_>) -> Result<Outcome> + 'p;

pub trait Interceptor: Send + Sync {
    /// The (target, method) points this interceptor wants; everything else
    /// bypasses it.
    fn points(&self) -> &[InterceptPoint];

    /// Handle the invocation. Implementations may inspect or rewrite the
    /// arguments, call `proceed` zero or more times, and transform the
    /// outcome.
    fn intercept(&self, invocation: Invocation<'_>, proceed: &mut Proceed<'_>) -> Result<Outcome>;

    /// Properties from the `<plugin>` element, applied before registration.
    fn set_properties(&mut self, properties: &AHashMap<String, String>) {
        let _ = properties;
    }
}

/// Runs an invocation through the matching interceptors in registration
/// order. The first registered interceptor runs outermost.
pub fn run_chain(
    interceptors: &[Arc<dyn Interceptor>],
    invocation: Invocation<'_>,
    terminal: &mut Proceed<'_>,
) -> Result<Outcome> {
    match interceptors.split_first() {
        None => terminal(invocation),
        Some((head, rest)) => {
            if head.points().contains(&invocation.point()) {
                head.intercept(invocation, &mut |next| run_chain(rest, next, terminal))
            } else {
                run_chain(rest, invocation, terminal)
            }
        }
    }
}
