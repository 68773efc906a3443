//! Query representation: a stream root followed by chained operators.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use dmreg_core::id::QueryId;
use dmreg_core::schema::NodeKind;
use dmreg_core::tuple::{Tuple, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Source,
    Event,
    Object,
}

impl StreamKind {
    /// Schema node kind the stream must be rooted at.
    pub fn node_kind(self) -> NodeKind {
        match self {
            StreamKind::Source => NodeKind::Source,
            StreamKind::Event => NodeKind::Event,
            StreamKind::Object => NodeKind::Object,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            StreamKind::Source => 0,
            StreamKind::Event => 1,
            StreamKind::Object => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StreamKind::Source),
            1 => Some(StreamKind::Event),
            2 => Some(StreamKind::Object),
            _ => None,
        }
    }
}

/// Object lifecycle events a stream subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMask(pub u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const CREATE: EventMask = EventMask(1);
    pub const DELETE: EventMask = EventMask(2);
    pub const STATUS: EventMask = EventMask(4);
    pub const ALL: EventMask = EventMask(1 | 2 | 4);

    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when no bit outside create|delete|status is set.
    pub fn is_valid(self) -> bool {
        self.0 & !Self::ALL.0 == 0
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::CREATE),
            "delete" => Some(Self::DELETE),
            "status" => Some(Self::STATUS),
            _ => None,
        }
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// Root of every query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOp {
    pub kind: StreamKind,
    pub path: String,
    /// Parameters for nested objects (which instances to poll).
    #[serde(default)]
    pub selectors: Vec<Value>,
    /// Polling period; sources only.
    #[serde(default)]
    pub period_ms: u64,
    /// Subscribed lifecycle events; objects only.
    #[serde(default)]
    pub events: EventMask,
}

impl StreamOp {
    pub fn source(path: impl Into<String>, period_ms: u64) -> Self {
        Self {
            kind: StreamKind::Source,
            path: path.into(),
            selectors: Vec::new(),
            period_ms,
            events: EventMask::NONE,
        }
    }

    pub fn event(path: impl Into<String>) -> Self {
        Self {
            kind: StreamKind::Event,
            path: path.into(),
            selectors: Vec::new(),
            period_ms: 0,
            events: EventMask::NONE,
        }
    }

    pub fn object(path: impl Into<String>, events: EventMask) -> Self {
        Self {
            kind: StreamKind::Object,
            path: path.into(),
            selectors: Vec::new(),
            period_ms: 0,
            events,
        }
    }

    pub fn with_selectors(mut self, selectors: Vec<Value>) -> Self {
        self.selectors = selectors;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub const ALL: [CmpOp; 6] = [CmpOp::Eq, CmpOp::Ne, CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// `eq`/`==`, `ne`/`!=`, `lt`/`<`, `le`/`<=`, `gt`/`>`, `ge`/`>=`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" | "==" => Some(CmpOp::Eq),
            "ne" | "!=" => Some(CmpOp::Ne),
            "lt" | "<" => Some(CmpOp::Lt),
            "le" | "<=" => Some(CmpOp::Le),
            "gt" | ">" => Some(CmpOp::Gt),
            "ge" | ">=" => Some(CmpOp::Ge),
            _ => None,
        }
    }

    /// Only equality tests are defined on strings.
    pub fn is_equality(self) -> bool {
        matches!(self, CmpOp::Eq | CmpOp::Ne)
    }

    pub fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// One side of a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operand {
    Literal(Value),
    /// Schema path into the current tuple.
    Element(String),
    /// Schema path into the joined stream.
    Joined(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub left: Operand,
    pub cmp: CmpOp,
    pub right: Operand,
}

impl Predicate {
    pub fn new(left: Operand, cmp: CmpOp, right: Operand) -> Self {
        Self { left, cmp, right }
    }

    /// `element <cmp> literal`, the common case.
    pub fn element(path: impl Into<String>, cmp: CmpOp, literal: Value) -> Self {
        Self::new(Operand::Element(path.into()), cmp, Operand::Literal(literal))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Tuples,
}

impl WindowUnit {
    pub const ALL: [WindowUnit; 5] = [
        WindowUnit::Milliseconds,
        WindowUnit::Seconds,
        WindowUnit::Minutes,
        WindowUnit::Hours,
        WindowUnit::Tuples,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ms" => Some(WindowUnit::Milliseconds),
            "s" => Some(WindowUnit::Seconds),
            "min" => Some(WindowUnit::Minutes),
            "h" => Some(WindowUnit::Hours),
            "tuples" => Some(WindowUnit::Tuples),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub size: u32,
    pub unit: WindowUnit,
}

impl Window {
    pub fn new(size: u32, unit: WindowUnit) -> Self {
        Self { size, unit }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Min,
    Max,
    Avg,
}

impl AggFunc {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AggFunc::Min),
            1 => Some(AggFunc::Max),
            2 => Some(AggFunc::Avg),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            "avg" => Some(AggFunc::Avg),
            _ => None,
        }
    }
}

/// One link of the operator chain.
///
/// Sort, Group, Aggregate and Join are validated against the schema but the
/// executor passes tuples through them unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operator {
    Stream(StreamOp),
    Filter {
        predicates: Vec<Predicate>,
    },
    Select {
        elements: Vec<String>,
    },
    Sort {
        elements: Vec<String>,
        window: Window,
    },
    Group {
        elements: Vec<String>,
    },
    Aggregate {
        func: AggFunc,
        elements: Vec<String>,
        window: Window,
        advance: Window,
    },
    Join {
        target: String,
        predicates: Vec<Predicate>,
    },
}

impl Operator {
    /// Human-readable operator name (stable).
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Stream(_) => "stream",
            Operator::Filter { .. } => "filter",
            Operator::Select { .. } => "select",
            Operator::Sort { .. } => "sort",
            Operator::Group { .. } => "group",
            Operator::Aggregate { .. } => "aggregate",
            Operator::Join { .. } => "join",
        }
    }

    /// Wire tag of the operator in query blocks.
    pub fn code(&self) -> u8 {
        match self {
            Operator::Stream(_) => 0,
            Operator::Filter { .. } => 1,
            Operator::Select { .. } => 2,
            Operator::Sort { .. } => 3,
            Operator::Group { .. } => 4,
            Operator::Aggregate { .. } => 5,
            Operator::Join { .. } => 6,
        }
    }
}

/// Completion callback. The receiver owns the tuple.
pub type CompletionFn = Arc<dyn Fn(QueryId, Tuple) + Send + Sync>;

/// Query flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryFlags(pub u32);

impl QueryFlags {
    /// Completed tuples are delivered in compact form.
    pub const COMPACT: u32 = 1;
    /// The query arrived over the cross-boundary channel.
    pub const TRANSFERRED: u32 = 2;

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Who releases the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    /// The registering provider keeps it alive and unregisters it.
    Provider,
    /// Received over the channel; the registry owns and releases it.
    Transferred,
}

/// A registered operator chain plus its completion callback.
#[derive(Clone)]
pub struct Query {
    pub id: QueryId,
    pub name: String,
    pub ops: Vec<Operator>,
    pub flags: QueryFlags,
    pub ownership: Ownership,
    /// Size of the relocatable encoding, filled in on transfer.
    pub size_bytes: usize,
    on_completed: CompletionFn,
}

impl Query {
    pub fn new(name: impl Into<String>, ops: Vec<Operator>, on_completed: CompletionFn) -> Self {
        Self {
            id: QueryId::UNASSIGNED,
            name: name.into(),
            ops,
            flags: QueryFlags::default(),
            ownership: Ownership::Provider,
            size_bytes: 0,
            on_completed,
        }
    }

    /// A query received over the channel. The registry owns it.
    pub fn transferred(
        name: impl Into<String>,
        ops: Vec<Operator>,
        on_completed: CompletionFn,
        size_bytes: usize,
    ) -> Self {
        let mut q = Self::new(name, ops, on_completed);
        q.flags = QueryFlags(q.flags.0 | QueryFlags::TRANSFERRED);
        q.ownership = Ownership::Transferred;
        q.size_bytes = size_bytes;
        q
    }

    /// Root stream, if the chain starts with one.
    pub fn stream(&self) -> Option<&StreamOp> {
        match self.ops.first() {
            Some(Operator::Stream(s)) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn complete(&self, tuple: Tuple) {
        (self.on_completed)(self.id, tuple)
    }

    pub fn on_completed(&self) -> &CompletionFn {
        &self.on_completed
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ops", &self.ops)
            .field("flags", &self.flags)
            .field("ownership", &self.ownership)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}
