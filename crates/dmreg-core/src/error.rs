use thiserror::Error;

/// Canonical result for the registry stack.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes shared by the schema tree, tuple store, query validator and
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    // structural
    #[error("node requires at least one child")]
    NoChildren,
    #[error("node must not have children")]
    UnexpectedChildren,
    #[error("child kind not permitted under this node")]
    WrongChildType,
    #[error("two siblings share the same name")]
    DuplicateSibling,

    // typing
    #[error("node is missing its type information")]
    MissingTypeInfo,
    #[error("node carries type information it must not have")]
    UnexpectedTypeInfo,
    #[error("return or identifier type not allowed here")]
    WrongReturnType,
    #[error("complex or referenced type does not resolve")]
    UnresolvedType,
    #[error("provider callback missing")]
    MissingCallback,
    #[error("node name is empty, too long or contains '.'")]
    BadName,

    // identity
    #[error("a node with the same name and kind already exists")]
    SameNode,
    #[error("object exists with a different identifier type")]
    ObjectIdent,
    #[error("a node with the same name but a different type exists")]
    DifferentNodeType,

    // query syntax
    #[error("operator in wrong position")]
    WrongOrder,
    #[error("source stream needs a period > 0")]
    NoFrequency,
    #[error("object stream event mask must be a subset of create|delete|status")]
    NoObjectStatus,
    #[error("stream kind does not match the schema node")]
    WrongStreamType,
    #[error("stream path does not resolve")]
    StreamNotFound,
    #[error("operator needs at least one predicate")]
    NoPredicates,
    #[error("operator needs at least one element")]
    NoElements,
    #[error("element does not resolve")]
    NoElement,
    #[error("window unit out of range")]
    Unit,
    #[error("window size or advance is zero")]
    Size,
    #[error("join target must be a source or object")]
    JoinType,
    #[error("unknown operator")]
    WrongOperator,

    // resources
    #[error("out of memory")]
    OutOfMemory,
    #[error("query slot table of the node is full")]
    QuerySlotsFull,

    // parameters
    #[error("required argument missing")]
    NullArgument,
    #[error("path not found")]
    NotFound,
    #[error("query not registered")]
    QueryNotFound,
    #[error("value does not match the schema type")]
    TypeMismatch,
    #[error("array index out of bounds")]
    OutOfBounds,

    // transport
    #[error("malformed relocatable block")]
    BadBlock,
    #[error("channel closed")]
    ChannelClosed,
}

/// An [`ErrorKind`] plus the location it was raised at: a schema path for
/// tree errors, `op[i]` for query errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}", location_suffix(.at))]
pub struct Error {
    kind: ErrorKind,
    at: Option<String>,
}

fn location_suffix(at: &Option<String>) -> String {
    match at {
        Some(p) => format!(" (at {p})"),
        None => String::new(),
    }
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, at: None }
    }

    pub fn at(kind: ErrorKind, location: impl Into<String>) -> Self {
        Self {
            kind,
            at: Some(location.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Path of the offending node, or `op[i]` for an offending operator.
    pub fn location(&self) -> Option<&str> {
        self.at.as_deref()
    }

    /// Attach a location if none was recorded yet.
    pub fn or_at(mut self, location: impl Into<String>) -> Self {
        if self.at.is_none() {
            self.at = Some(location.into());
        }
        self
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}
