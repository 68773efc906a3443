//! Predicate evaluation for the Filter operator.
//!
//! Comparison is typed by the schema type of the stream-side operand (the
//! element reference); a literal on the other side is converted to that type.
//! Strings support `==` and `!=` only; numeric types the full relational set.

use dmreg_core::error::{Error, ErrorKind, Result};
use dmreg_core::schema::{Primitive, SchemaTree, ValueBase};
use dmreg_core::tuple::{Tuple, Value};

use crate::model::{CmpOp, Operand, Predicate};

/// Evaluate one predicate against `tuple`.
pub fn eval_predicate(tree: &SchemaTree, tuple: &Tuple, p: &Predicate) -> Result<bool> {
    let stream_side = match (&p.left, &p.right) {
        (Operand::Element(path), _) | (_, Operand::Element(path)) => path,
        _ => return Err(ErrorKind::NoElement.into()),
    };
    let ty = tuple.element_type(tree, stream_side)?;
    let prim = match ty.base {
        ValueBase::Primitive(prim) if !ty.array => prim,
        _ => return Err(Error::at(ErrorKind::TypeMismatch, stream_side.as_str())),
    };

    let left = operand_value(tree, tuple, &p.left, prim)?;
    let right = operand_value(tree, tuple, &p.right, prim)?;

    if prim == Primitive::String && !p.cmp.is_equality() {
        return Err(Error::at(ErrorKind::TypeMismatch, stream_side.as_str()));
    }
    let ord = left
        .compare(&right)
        .ok_or_else(|| Error::at(ErrorKind::TypeMismatch, stream_side.as_str()))?;
    Ok(p.cmp.holds(ord))
}

fn operand_value(tree: &SchemaTree, tuple: &Tuple, operand: &Operand, prim: Primitive) -> Result<Value> {
    match operand {
        Operand::Element(path) => Ok(tuple.get(tree, path)?.clone()),
        Operand::Literal(v) => coerce(v, prim),
        // joins are not executed
        Operand::Joined(path) => Err(Error::at(ErrorKind::NoElement, path.as_str())),
    }
}

/// Convert a literal to `prim`, widening ints to floats and narrowing ints to
/// bytes when they fit.
fn coerce(v: &Value, prim: Primitive) -> Result<Value> {
    let out = match (prim, v) {
        (Primitive::Int, Value::Int(i)) => Value::Int(*i),
        (Primitive::Int, Value::Byte(b)) => Value::Int(*b as i32),
        (Primitive::Float, Value::Float(f)) => Value::Float(*f),
        (Primitive::Float, Value::Int(i)) => Value::Float(*i as f64),
        (Primitive::Float, Value::Byte(b)) => Value::Float(*b as f64),
        (Primitive::Byte, Value::Byte(b)) => Value::Byte(*b),
        (Primitive::Byte, Value::Int(i)) => {
            Value::Byte(u8::try_from(*i).map_err(|_| ErrorKind::TypeMismatch)?)
        }
        (Primitive::String, Value::Str(s)) => Value::Str(s.clone()),
        _ => return Err(ErrorKind::TypeMismatch.into()),
    };
    Ok(out)
}

/// True when every predicate holds (AND semantics). The first failing or
/// unevaluable predicate short-circuits.
pub fn eval_all(tree: &SchemaTree, tuple: &Tuple, predicates: &[Predicate]) -> Result<bool> {
    for p in predicates {
        if !eval_predicate(tree, tuple, p)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmreg_core::schema::Node;

    fn setup() -> (SchemaTree, Tuple) {
        let mut t = SchemaTree::new();
        let root = t.root().unwrap();
        let net = t.add(root, Node::namespace("net")).unwrap();
        let pkt = t.add(net, Node::complex("pkt")).unwrap();
        t.add(pkt, Node::primitive("proto", Primitive::Int)).unwrap();
        t.add(pkt, Node::primitive("iface", Primitive::String)).unwrap();
        t.add(pkt, Node::primitive("load", Primitive::Float)).unwrap();

        let mut tup = Tuple::allocate(1);
        tup.alloc_item(&t, 0, "net.pkt").unwrap();
        tup.set_int(&t, "net.pkt.proto", 42).unwrap();
        tup.set_string(&t, "net.pkt.iface", "eth0").unwrap();
        tup.set_float(&t, "net.pkt.load", 0.5).unwrap();
        (t, tup)
    }

    #[test]
    fn int_predicates_use_full_relational_set() {
        let (t, tup) = setup();
        let p = |cmp, v| Predicate::element("net.pkt.proto", cmp, Value::Int(v));
        assert!(eval_predicate(&t, &tup, &p(CmpOp::Eq, 42)).unwrap());
        assert!(eval_predicate(&t, &tup, &p(CmpOp::Ge, 42)).unwrap());
        assert!(eval_predicate(&t, &tup, &p(CmpOp::Lt, 43)).unwrap());
        assert!(!eval_predicate(&t, &tup, &p(CmpOp::Gt, 42)).unwrap());
        assert!(!eval_predicate(&t, &tup, &p(CmpOp::Ne, 42)).unwrap());
    }

    #[test]
    fn int_literal_widens_for_float_element() {
        let (t, tup) = setup();
        let p = Predicate::element("net.pkt.load", CmpOp::Lt, Value::Int(1));
        assert!(eval_predicate(&t, &tup, &p).unwrap());
    }

    #[test]
    fn strings_only_support_equality() {
        let (t, tup) = setup();
        let eq = Predicate::element("net.pkt.iface", CmpOp::Eq, Value::Str("eth0".into()));
        assert!(eval_predicate(&t, &tup, &eq).unwrap());
        let lt = Predicate::element("net.pkt.iface", CmpOp::Lt, Value::Str("zz".into()));
        assert_eq!(
            eval_predicate(&t, &tup, &lt).unwrap_err().kind(),
            ErrorKind::TypeMismatch
        );
    }

    #[test]
    fn literal_on_the_left_is_accepted() {
        let (t, tup) = setup();
        let p = Predicate::new(
            Operand::Literal(Value::Int(40)),
            CmpOp::Lt,
            Operand::Element("net.pkt.proto".into()),
        );
        assert!(eval_predicate(&t, &tup, &p).unwrap());
    }
}
