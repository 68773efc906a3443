//! Flat encoding of queries for `QueryAdd`, `QueryDelete` and
//! `QueryContinue` messages.
//!
//! Queries hold no internal pointers worth preserving, so the block is a
//! plain stream of length-prefixed records. Completion callbacks never cross
//! the boundary; the receiver supplies its own.

use dmreg_core::error::{Error, ErrorKind, Result};
use dmreg_core::tuple::Value;
use dmreg_core::QueryId;
use dmreg_query::{
    AggFunc, CmpOp, CompletionFn, EventMask, Operand, Operator, Predicate, Query, QueryFlags,
    StreamKind, StreamOp, Window, WindowUnit,
};

use crate::cursor::{Stream, Writer};

const OP_STREAM: u8 = 0;
const OP_FILTER: u8 = 1;
const OP_SELECT: u8 = 2;
const OP_SORT: u8 = 3;
const OP_GROUP: u8 = 4;
const OP_AGGREGATE: u8 = 5;
const OP_JOIN: u8 = 6;

const V_BYTE: u8 = 0;
const V_INT: u8 = 1;
const V_FLOAT: u8 = 2;
const V_STR: u8 = 3;
const V_ARRAY: u8 = 4;
const V_COMPLEX: u8 = 5;

/// Smallest encodings: a query with an empty name and no operators, and an
/// operator with an empty element or predicate list.
const MIN_QUERY_RECORD_LEN: usize = 4 + 8 + 4 + 4 + 4;
const MIN_OPERATOR_LEN: usize = 1 + 4;

const OPERAND_LITERAL: u8 = 0;
const OPERAND_ELEMENT: u8 = 1;
const OPERAND_JOINED: u8 = 2;

/// A decoded query, still without a completion callback.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    /// Id assigned by the sender.
    pub id: QueryId,
    pub name: String,
    pub ops: Vec<Operator>,
    pub flags: QueryFlags,
    /// Encoded size of this record.
    pub size_bytes: usize,
}

impl QueryRecord {
    /// Turn the record into a registry-owned query.
    pub fn into_query(self, on_completed: CompletionFn) -> Query {
        let mut q = Query::transferred(self.name, self.ops, on_completed, self.size_bytes);
        q.flags = QueryFlags(q.flags.0 | self.flags.0);
        q
    }
}

fn bad(what: &str) -> Error {
    Error::at(ErrorKind::BadBlock, what)
}

/// Preallocation for `count` records of at least `min_len` bytes each; a
/// forged count cannot reserve more than `available` bytes could hold.
fn capacity_hint(count: usize, available: usize, min_len: usize) -> usize {
    count.min(available / min_len)
}

pub fn encode_queries(queries: &[Query]) -> Vec<u8> {
    let mut w = Writer::new(0);
    w.put_u32(queries.len() as u32);
    for q in queries {
        let size_at = w.reserve(4);
        let start = w.len();
        w.put_u64(q.id.get());
        w.put_u32(q.flags.0);
        w.put_str(&q.name);
        w.put_u32(q.ops.len() as u32);
        for op in &q.ops {
            put_operator(&mut w, op);
        }
        let size = w.len() - start;
        w.set_u32(size_at, size as u32);
    }
    w.into_inner()
}

pub fn decode_queries(buf: &[u8]) -> Result<Vec<QueryRecord>> {
    let mut s = Stream::new(buf);
    let count = s.u32()? as usize;
    let mut out = Vec::with_capacity(capacity_hint(count, buf.len(), MIN_QUERY_RECORD_LEN));
    for _ in 0..count {
        let size = s.u32()? as usize;
        let id = QueryId::new(s.u64()?);
        let flags = QueryFlags(s.u32()?);
        let name = s.str()?;
        let n_ops = s.u32()? as usize;
        let mut ops = Vec::with_capacity(capacity_hint(n_ops, buf.len(), MIN_OPERATOR_LEN));
        for i in 0..n_ops {
            ops.push(get_operator(&mut s).map_err(|e| e.or_at(format!("op[{i}]")))?);
        }
        out.push(QueryRecord {
            id,
            name,
            ops,
            flags,
            size_bytes: size,
        });
    }
    if !s.is_at_end() {
        return Err(bad("trailing bytes after queries"));
    }
    Ok(out)
}

pub fn encode_query_ids(ids: &[QueryId]) -> Vec<u8> {
    let mut w = Writer::with_capacity(0, 4 + 8 * ids.len());
    w.put_u32(ids.len() as u32);
    for id in ids {
        w.put_u64(id.get());
    }
    w.into_inner()
}

pub fn decode_query_ids(buf: &[u8]) -> Result<Vec<QueryId>> {
    let mut s = Stream::new(buf);
    let count = s.u32()? as usize;
    let mut out = Vec::with_capacity(capacity_hint(count, buf.len(), 8));
    for _ in 0..count {
        out.push(QueryId::new(s.u64()?));
    }
    if !s.is_at_end() {
        return Err(bad("trailing bytes after query ids"));
    }
    Ok(out)
}

/// Header of a `QueryContinue` payload: query id, step to resume at. The
/// tuple chain block follows.
pub const CONTINUE_HEADER_SIZE: usize = 16;

pub fn encode_continue(query: QueryId, step: u32, chain: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(0, CONTINUE_HEADER_SIZE + chain.len());
    w.put_u64(query.get());
    w.put_u32(step);
    w.put_u32(0);
    w.put_bytes(chain);
    w.into_inner()
}

/// Split a continue payload into (query, step, chain bytes).
pub fn decode_continue(buf: &[u8]) -> Result<(QueryId, u32, &[u8])> {
    let mut s = Stream::new(buf);
    let id = QueryId::new(s.u64()?);
    let step = s.u32()?;
    s.u32()?;
    Ok((id, step, &buf[CONTINUE_HEADER_SIZE..]))
}

fn put_strings(w: &mut Writer, items: &[String]) {
    w.put_u32(items.len() as u32);
    for i in items {
        w.put_str(i);
    }
}

fn put_window(w: &mut Writer, win: &Window) {
    w.put_u32(win.size);
    w.put_u8(win.unit.code());
}

fn put_value(w: &mut Writer, v: &Value) {
    match v {
        Value::Byte(b) => {
            w.put_u8(V_BYTE);
            w.put_u8(*b);
        }
        Value::Int(i) => {
            w.put_u8(V_INT);
            w.put_u32(*i as u32);
        }
        Value::Float(f) => {
            w.put_u8(V_FLOAT);
            w.put_u64(f.to_bits());
        }
        Value::Str(s) => {
            w.put_u8(V_STR);
            w.put_str(s);
        }
        Value::Array(vs) | Value::Complex(vs) => {
            w.put_u8(if matches!(v, Value::Array(_)) { V_ARRAY } else { V_COMPLEX });
            w.put_u32(vs.len() as u32);
            for e in vs {
                put_value(w, e);
            }
        }
    }
}

fn put_operand(w: &mut Writer, o: &Operand) {
    match o {
        Operand::Literal(v) => {
            w.put_u8(OPERAND_LITERAL);
            put_value(w, v);
        }
        Operand::Element(p) => {
            w.put_u8(OPERAND_ELEMENT);
            w.put_str(p);
        }
        Operand::Joined(p) => {
            w.put_u8(OPERAND_JOINED);
            w.put_str(p);
        }
    }
}

fn put_predicates(w: &mut Writer, preds: &[Predicate]) {
    w.put_u32(preds.len() as u32);
    for p in preds {
        put_operand(w, &p.left);
        w.put_u8(p.cmp.code());
        put_operand(w, &p.right);
    }
}

fn put_operator(w: &mut Writer, op: &Operator) {
    w.put_u8(op.code());
    match op {
        Operator::Stream(s) => {
            w.put_u8(s.kind.code());
            w.put_str(&s.path);
            w.put_u64(s.period_ms);
            w.put_u8(s.events.0);
            w.put_u32(s.selectors.len() as u32);
            for v in &s.selectors {
                put_value(w, v);
            }
        }
        Operator::Filter { predicates } => put_predicates(w, predicates),
        Operator::Select { elements } | Operator::Group { elements } => put_strings(w, elements),
        Operator::Sort { elements, window } => {
            put_strings(w, elements);
            put_window(w, window);
        }
        Operator::Aggregate {
            func,
            elements,
            window,
            advance,
        } => {
            w.put_u8(func.code());
            put_strings(w, elements);
            put_window(w, window);
            put_window(w, advance);
        }
        Operator::Join { target, predicates } => {
            w.put_str(target);
            put_predicates(w, predicates);
        }
    }
}

fn get_strings(s: &mut Stream<'_>) -> Result<Vec<String>> {
    let n = s.u32()? as usize;
    (0..n).map(|_| s.str()).collect()
}

fn get_window(s: &mut Stream<'_>) -> Result<Window> {
    let size = s.u32()?;
    let unit = WindowUnit::from_code(s.u8()?).ok_or(ErrorKind::Unit)?;
    Ok(Window::new(size, unit))
}

fn get_value(s: &mut Stream<'_>, depth: usize) -> Result<Value> {
    if depth > dmreg_core::schema::MAX_TYPE_DEPTH {
        return Err(bad("literal nested too deep"));
    }
    Ok(match s.u8()? {
        V_BYTE => Value::Byte(s.u8()?),
        V_INT => Value::Int(s.u32()? as i32),
        V_FLOAT => Value::Float(f64::from_bits(s.u64()?)),
        V_STR => Value::Str(s.str()?),
        tag @ (V_ARRAY | V_COMPLEX) => {
            let n = s.u32()? as usize;
            let vs = (0..n)
                .map(|_| get_value(s, depth + 1))
                .collect::<Result<Vec<_>>>()?;
            if tag == V_ARRAY {
                Value::Array(vs)
            } else {
                Value::Complex(vs)
            }
        }
        _ => return Err(bad("unknown value tag")),
    })
}

fn get_operand(s: &mut Stream<'_>) -> Result<Operand> {
    Ok(match s.u8()? {
        OPERAND_LITERAL => Operand::Literal(get_value(s, 0)?),
        OPERAND_ELEMENT => Operand::Element(s.str()?),
        OPERAND_JOINED => Operand::Joined(s.str()?),
        _ => return Err(bad("unknown operand tag")),
    })
}

fn get_predicates(s: &mut Stream<'_>) -> Result<Vec<Predicate>> {
    let n = s.u32()? as usize;
    (0..n)
        .map(|_| {
            let left = get_operand(s)?;
            let cmp = CmpOp::from_code(s.u8()?).ok_or_else(|| bad("unknown comparison"))?;
            let right = get_operand(s)?;
            Ok(Predicate::new(left, cmp, right))
        })
        .collect()
}

fn get_operator(s: &mut Stream<'_>) -> Result<Operator> {
    Ok(match s.u8()? {
        OP_STREAM => {
            let kind = StreamKind::from_code(s.u8()?).ok_or(ErrorKind::WrongStreamType)?;
            let path = s.str()?;
            let period_ms = s.u64()?;
            let events = EventMask(s.u8()?);
            let n = s.u32()? as usize;
            let selectors = (0..n).map(|_| get_value(s, 0)).collect::<Result<Vec<_>>>()?;
            Operator::Stream(StreamOp {
                kind,
                path,
                selectors,
                period_ms,
                events,
            })
        }
        OP_FILTER => Operator::Filter {
            predicates: get_predicates(s)?,
        },
        OP_SELECT => Operator::Select {
            elements: get_strings(s)?,
        },
        OP_SORT => Operator::Sort {
            elements: get_strings(s)?,
            window: get_window(s)?,
        },
        OP_GROUP => Operator::Group {
            elements: get_strings(s)?,
        },
        OP_AGGREGATE => {
            let func = AggFunc::from_code(s.u8()?).ok_or(ErrorKind::WrongOperator)?;
            Operator::Aggregate {
                func,
                elements: get_strings(s)?,
                window: get_window(s)?,
                advance: get_window(s)?,
            }
        }
        OP_JOIN => Operator::Join {
            target: s.str()?,
            predicates: get_predicates(s)?,
        },
        _ => return Err(ErrorKind::WrongOperator.into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_operator_tag_is_wrong_operator() {
        // one query, id 1, no flags, name "q", one op with tag 42
        let mut w = Writer::new(0);
        w.put_u32(1);
        w.put_u32(0);
        w.put_u64(1);
        w.put_u32(0);
        w.put_str("q");
        w.put_u32(1);
        w.put_u8(42);
        let err = decode_queries(&w.into_inner()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongOperator);
        assert_eq!(err.location(), Some("op[0]"));
    }

    #[test]
    fn forged_counts_are_bounded_by_the_block() {
        assert_eq!(capacity_hint(u32::MAX as usize, 48, MIN_QUERY_RECORD_LEN), 2);
        assert_eq!(capacity_hint(3, 4096, MIN_OPERATOR_LEN), 3);

        let mut w = Writer::new(0);
        w.put_u32(u32::MAX);
        w.put_u32(0);
        let err = decode_queries(&w.into_inner()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadBlock);

        // one query claiming u32::MAX operators
        let mut w = Writer::new(0);
        w.put_u32(1);
        w.put_u32(0);
        w.put_u64(1);
        w.put_u32(0);
        w.put_str("q");
        w.put_u32(u32::MAX);
        let err = decode_queries(&w.into_inner()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadBlock);
    }

    #[test]
    fn out_of_range_window_unit_is_unit_error() {
        let mut w = Writer::new(0);
        w.put_u32(1);
        w.put_u32(0);
        w.put_u64(1);
        w.put_u32(0);
        w.put_str("q");
        w.put_u32(1);
        w.put_u8(OP_SORT);
        w.put_u32(1);
        w.put_str("net.a");
        w.put_u32(10);
        w.put_u8(99);
        let err = decode_queries(&w.into_inner()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unit);
    }
}
