//! Bridge message shapes.
//!
//! Requests and responses travel as tagged tuples, themselves terms:
//!
//! - `{call, Id, Module, Function, Args}`
//! - `{reply, Id, {ok, Value}}` / `{reply, Id, {error, Reason}}`
//!
//! Correlation ids come from a per-link monotonic counter; responses match
//! requests by id, never by arrival order, which is what lets calls nest.

use std::fmt;

use crate::term::{Atom, Term};

const TAG_CALL: &str = "call";
const TAG_REPLY: &str = "reply";
const TAG_OK: &str = "ok";
const TAG_ERROR: &str = "error";

/// Token linking a response to the call that provoked it.
///
/// Unique for the lifetime of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a dispatched call produced: the handler's value, or a reason term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Ok(Term),
    Error(Term),
}

impl CallOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    fn into_term(self) -> Term {
        match self {
            Self::Ok(value) => Term::tuple([Term::atom(TAG_OK), value]),
            Self::Error(reason) => Term::tuple([Term::atom(TAG_ERROR), reason]),
        }
    }

    fn from_term(term: Term) -> Result<Self, ProtocolError> {
        let Term::Tuple(elements) = term else {
            return Err(ProtocolError::new("reply outcome is not a tuple"));
        };
        let [tag, payload]: [Term; 2] = elements.try_into().map_err(|e: Vec<Term>| {
            ProtocolError::new(format!("reply outcome has {} elements, expected 2", e.len()))
        })?;
        match tag.as_atom().map(Atom::as_str) {
            Some(TAG_OK) => Ok(Self::Ok(payload)),
            Some(TAG_ERROR) => Ok(Self::Error(payload)),
            _ => Err(ProtocolError::new("reply outcome tag is not ok/error")),
        }
    }
}

/// Well-formed term that does not spell a bridge message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed bridge message: {detail}")]
pub struct ProtocolError {
    detail: String,
}

impl ProtocolError {
    fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// One framed message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Request {
        id: CallId,
        module: Atom,
        function: Atom,
        args: Vec<Term>,
    },
    Response {
        id: CallId,
        outcome: CallOutcome,
    },
}

impl WireMessage {
    pub fn into_term(self) -> Term {
        match self {
            Self::Request {
                id,
                module,
                function,
                args,
            } => Term::tuple([
                Term::atom(TAG_CALL),
                Term::int(id.0 as i64),
                Term::Atom(module),
                Term::Atom(function),
                Term::List(args),
            ]),
            Self::Response { id, outcome } => Term::tuple([
                Term::atom(TAG_REPLY),
                Term::int(id.0 as i64),
                outcome.into_term(),
            ]),
        }
    }

    pub fn from_term(term: Term) -> Result<Self, ProtocolError> {
        let Term::Tuple(elements) = term else {
            return Err(ProtocolError::new("message is not a tuple"));
        };
        let tag = elements.first().and_then(Term::as_atom).cloned();
        match tag.as_ref().map(Atom::as_str) {
            Some(TAG_CALL) => Self::request_from(elements),
            Some(TAG_REPLY) => Self::response_from(elements),
            Some(other) => Err(ProtocolError::new(format!(
                "unknown message tag '{}'",
                other
            ))),
            None => Err(ProtocolError::new("message tag is not an atom")),
        }
    }

    fn request_from(elements: Vec<Term>) -> Result<Self, ProtocolError> {
        let [_, id, module, function, args]: [Term; 5] =
            elements.try_into().map_err(|e: Vec<Term>| {
                ProtocolError::new(format!("call has {} elements, expected 5", e.len()))
            })?;
        let id = parse_id(id)?;
        let module = parse_atom(module, "call module")?;
        let function = parse_atom(function, "call function")?;
        let Term::List(args) = args else {
            return Err(ProtocolError::new("call args is not a list"));
        };
        Ok(Self::Request {
            id,
            module,
            function,
            args,
        })
    }

    fn response_from(elements: Vec<Term>) -> Result<Self, ProtocolError> {
        let [_, id, outcome]: [Term; 3] = elements.try_into().map_err(|e: Vec<Term>| {
            ProtocolError::new(format!("reply has {} elements, expected 3", e.len()))
        })?;
        Ok(Self::Response {
            id: parse_id(id)?,
            outcome: CallOutcome::from_term(outcome)?,
        })
    }
}

fn parse_id(term: Term) -> Result<CallId, ProtocolError> {
    match term {
        Term::Integer(raw) if raw >= 0 => Ok(CallId(raw as u64)),
        Term::Integer(raw) => Err(ProtocolError::new(format!(
            "negative correlation id {}",
            raw
        ))),
        _ => Err(ProtocolError::new("correlation id is not an integer")),
    }
}

fn parse_atom(term: Term, what: &str) -> Result<Atom, ProtocolError> {
    match term {
        Term::Atom(a) => Ok(a),
        _ => Err(ProtocolError::new(format!("{} is not an atom", what))),
    }
}
