//! Handler registration and dispatch.
//!
//! The registry maps `(module, function)` atom pairs to async handlers. It
//! is populated before a link starts and read-only afterwards; there is no
//! ambient global table. Each incoming request dispatches on its own task,
//! so a handler that calls back through the link cannot stall the reader.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::link::CallHandle;
use crate::protocol::CallOutcome;
use crate::term::{Atom, Term};

/// Handler-declared failure; becomes an `{error, Reason}` reply and never
/// escapes to the transport layer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("handler fault: {reason}")]
pub struct Fault {
    reason: Term,
}

impl Fault {
    pub fn new(reason: impl Into<Term>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// `{error, Message}` with a string payload, for ad-hoc failures.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            reason: Term::tuple([Term::atom("error"), Term::str(text)]),
        }
    }

    pub fn reason(&self) -> &Term {
        &self.reason
    }

    pub fn into_reason(self) -> Term {
        self.reason
    }
}

pub type HandlerResult = Result<Term, Fault>;

/// A locally registered target function.
///
/// Handlers receive a [`CallHandle`] bound to the link that delivered the
/// request, so they can issue nested calls back to the peer before
/// returning.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, caller: CallHandle, args: Vec<Term>) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CallHandle, Vec<Term>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, caller: CallHandle, args: Vec<Term>) -> HandlerResult {
        (self.0)(caller, args).await
    }
}

struct Entry {
    arity: usize,
    handler: Arc<dyn Handler>,
}

/// Registered function table: `(module, function)` to handler, fixed arity.
#[derive(Default)]
pub struct HandlerRegistry {
    table: HashMap<(Atom, Atom), Entry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; a later registration for the same name replaces
    /// the earlier one.
    pub fn register(
        &mut self,
        module: impl Into<Atom>,
        function: impl Into<Atom>,
        arity: usize,
        handler: Arc<dyn Handler>,
    ) {
        let module = module.into();
        let function = function.into();
        tracing::debug!(%module, %function, arity, "registering handler");
        self.table.insert((module, function), Entry { arity, handler });
    }

    /// Registers an async closure.
    pub fn register_fn<F, Fut>(
        &mut self,
        module: impl Into<Atom>,
        function: impl Into<Atom>,
        arity: usize,
        f: F,
    ) where
        F: Fn(CallHandle, Vec<Term>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(module, function, arity, Arc::new(FnHandler(f)));
    }

    pub fn contains(&self, module: &Atom, function: &Atom) -> bool {
        self.table
            .contains_key(&(module.clone(), function.clone()))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Resolves and invokes the target function for one request.
    ///
    /// A miss, or a hit with the wrong arity, answers `{error, undef}` (the
    /// table resolves by module:function/arity). The handler runs on its
    /// own task; a panic is caught via the task's join error and answered
    /// as `{error, {handler_panic, Reason}}`, so a broken handler never
    /// tears down the connection.
    pub async fn dispatch(
        &self,
        caller: CallHandle,
        module: Atom,
        function: Atom,
        args: Vec<Term>,
    ) -> CallOutcome {
        let Some(entry) = self.table.get(&(module.clone(), function.clone())) else {
            tracing::debug!(%module, %function, "call to unregistered function");
            return CallOutcome::Error(Term::atom("undef"));
        };
        if entry.arity != args.len() {
            tracing::debug!(
                %module,
                %function,
                expected = entry.arity,
                got = args.len(),
                "call with wrong arity"
            );
            return CallOutcome::Error(Term::atom("undef"));
        }

        let handler = Arc::clone(&entry.handler);
        let invocation = tokio::spawn(async move { handler.handle(caller, args).await });
        match invocation.await {
            Ok(Ok(value)) => CallOutcome::Ok(value),
            Ok(Err(fault)) => {
                tracing::debug!(%module, %function, reason = %fault.reason(), "handler fault");
                CallOutcome::Error(fault.into_reason())
            }
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    describe_panic(join_error.into_panic())
                } else {
                    "cancelled".to_string()
                };
                tracing::error!(%module, %function, %reason, "handler crashed");
                CallOutcome::Error(Term::tuple([
                    Term::atom("handler_panic"),
                    Term::str(reason),
                ]))
            }
        }
    }
}

fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
