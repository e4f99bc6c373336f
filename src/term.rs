//! Tagged term values exchanged across the bridge.
//!
//! A [`Term`] is immutable once constructed and owned by-value; both sides
//! of a link see their own copy. Equality, ordering and hashing are total
//! (floats compare by bit pattern / `total_cmp`), so terms can key a
//! [`Term::Map`] and round-trip comparisons are exact even for NaN.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Symbolic name: modules, functions, and wire tags travel as atoms.
///
/// Cheap to clone; comparison is by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Atom(Arc<str>);

impl Atom {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Atom {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Atom {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tagged, immutable value exchanged across the bridge.
#[derive(Debug, Clone)]
pub enum Term {
    Integer(i64),
    Float(f64),
    Atom(Atom),
    /// Raw byte sequence; length and content preserved exactly, embedded
    /// zero bytes included.
    Binary(Vec<u8>),
    /// Codepoint sequence (UTF-8 on the wire).
    Str(String),
    Tuple(Vec<Term>),
    List(Vec<Term>),
    /// Keys are unique; iteration (and wire order) follows term order.
    Map(BTreeMap<Term, Term>),
}

impl Term {
    pub fn int(value: impl Into<i64>) -> Self {
        Self::Integer(value.into())
    }

    pub fn float(value: f64) -> Self {
        Self::Float(value)
    }

    pub fn atom(name: impl Into<Atom>) -> Self {
        Self::Atom(name.into())
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Binary(bytes.into())
    }

    pub fn str(text: impl Into<String>) -> Self {
        Self::Str(text.into())
    }

    pub fn tuple(elements: impl IntoIterator<Item = Term>) -> Self {
        Self::Tuple(elements.into_iter().collect())
    }

    pub fn list(elements: impl IntoIterator<Item = Term>) -> Self {
        Self::List(elements.into_iter().collect())
    }

    /// Builds a map from pairs; a later duplicate key replaces the earlier one.
    pub fn map(pairs: impl IntoIterator<Item = (Term, Term)>) -> Self {
        Self::Map(pairs.into_iter().collect())
    }

    /// List of integer codepoints, the charlist rendition of a string.
    pub fn charlist(text: &str) -> Self {
        Self::List(text.chars().map(|c| Term::Integer(c as i64)).collect())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_atom(&self) -> Option<&Atom> {
        match self {
            Self::Atom(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Self::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Term, Term>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Reassembles a charlist into a string; `None` if any element is not a
    /// valid codepoint.
    pub fn as_charlist(&self) -> Option<String> {
        let elements = self.as_list()?;
        let mut out = String::with_capacity(elements.len());
        for element in elements {
            let cp = u32::try_from(element.as_integer()?).ok()?;
            out.push(char::from_u32(cp)?);
        }
        Some(out)
    }

    /// Structural ordering rank; cross-variant comparisons order by variant
    /// first, then contents.
    fn rank(&self) -> u8 {
        match self {
            Self::Integer(_) => 0,
            Self::Float(_) => 1,
            Self::Atom(_) => 2,
            Self::Binary(_) => 3,
            Self::Str(_) => 4,
            Self::Tuple(_) => 5,
            Self::List(_) => 6,
            Self::Map(_) => 7,
        }
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Term {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<f64> for Term {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Term {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Atom> for Term {
    fn from(value: Atom) -> Self {
        Self::Atom(value)
    }
}

impl From<Vec<Term>> for Term {
    fn from(value: Vec<Term>) -> Self {
        Self::List(value)
    }
}

// Floats compare by bit pattern so equality stays reflexive (NaN == NaN) and
// decode(encode(t)) == t holds for every representable term.
impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Atom(a), Self::Atom(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Term {}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Atom(a), Self::Atom(b)) => a.cmp(b),
            (Self::Binary(a), Self::Binary(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Tuple(a), Self::Tuple(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => a.cmp(b),
            (Self::Map(a), Self::Map(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Term {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            Self::Integer(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::Atom(a) => a.hash(state),
            Self::Binary(b) => b.hash(state),
            Self::Str(s) => s.hash(state),
            Self::Tuple(t) => t.hash(state),
            Self::List(l) => l.hash(state),
            Self::Map(m) => {
                state.write_u64(m.len() as u64);
                for (k, v) in m {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{:?}", v),
            Self::Atom(a) => write!(f, "{}", a),
            Self::Binary(bytes) => {
                f.write_str("<<")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", b)?;
                }
                f.write_str(">>")
            }
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Tuple(elements) => {
                f.write_str("{")?;
                fmt_joined(f, elements)?;
                f.write_str("}")
            }
            Self::List(elements) => {
                f.write_str("[")?;
                fmt_joined(f, elements)?;
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("#{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} => {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

fn fmt_joined(f: &mut fmt::Formatter<'_>, elements: &[Term]) -> fmt::Result {
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", element)?;
    }
    Ok(())
}
