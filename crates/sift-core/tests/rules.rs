//! Rule language behavior against in-memory data.

use pretty_assertions::assert_eq;
use sift_core::{
    BinaryOp, Environment, Error, Expr, Kind, Match, Number, OperatorRegistry, Primitive,
    RuleSet, SeekSource, Signature, UnaryOp, Width,
};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const DATA: &[u8] = &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

fn evaluate(
    text: &str,
    data: &[u8],
    operators: &OperatorRegistry,
) -> sift_core::Result<Option<Match>> {
    let rules = RuleSet::parse("test.sift", text, operators)?;
    let source = SeekSource::new(Cursor::new(data.to_vec())).unwrap();
    let mut env = Environment::new(&rules, operators, source);
    env.evaluate_rule(rules.roots()[0])
}

fn matched(text: &str, data: &[u8]) -> Match {
    evaluate(text, data, &OperatorRegistry::with_builtins())
        .unwrap()
        .expect("rule should match")
}

fn num(m: &Match, name: &str) -> i128 {
    m.vars[name].as_number().unwrap().get()
}

#[test]
fn test_big_endian_by_default() {
    let m = matched("rule t { var a = Byte(0); var b = Short(1); var c = Long(2); }", DATA);
    assert_eq!(num(&m, "a"), 0x00);
    assert_eq!(num(&m, "b"), 0x0102);
    assert_eq!(num(&m, "c"), 0x0203_0405);
}

#[test]
fn test_little_endian_rule_metadata() {
    let m = matched(
        "rule t (bigendian=false) { var a = Byte(0); var b = Short(1); var c = Long(2); }",
        DATA,
    );
    assert_eq!(num(&m, "b"), 0x0201);
    assert_eq!(num(&m, "c"), 0x0504_0302);
}

#[test]
fn test_per_field_endianness_override() {
    let m = matched(
        "rule t (bigendian=false) {
            var a = Byte(0);
            var b = Short(1, bigendian=true);
            var c = Long(2);
        }",
        DATA,
    );
    assert_eq!(num(&m, "b"), 0x0102);
    assert_eq!(num(&m, "c"), 0x0504_0302);
}

#[test]
fn test_metadata_resolved_at_declaration() {
    let m = matched(
        r#"
        rule r1 (bigendian=false) { var x = Short(1); }
        rule test (bigendian=true) : r1 { var y = Short(1); }
        "#,
        DATA,
    );
    let test = m.find("test").unwrap();
    assert_eq!(num(test, "x"), 0x0201);
    assert_eq!(num(test, "y"), 0x0102);
}

#[test]
fn test_signed_extract() {
    let m = matched("rule t { var a = Byte(0, signed=true); }", &[0xff]);
    assert_eq!(num(&m, "a"), -1);
    assert_eq!(
        m.vars["a"].as_number().unwrap(),
        &Number::signed(-1, Width::W1)
    );
}

#[test]
fn test_string_extracts() {
    let m = matched(
        r#"rule t { var magic = String(0, 4); var name = StringZ(4, 16); if magic == "\x7fELF"; }"#,
        b"\x7fELFboot\0junk",
    );
    assert_eq!(m.vars["name"], Primitive::from("boot"));
}

#[test]
fn test_constant_folding() {
    let rules = RuleSet::parse(
        "test.sift",
        "rule t { var x = 100 + 51; var y = Byte(0) + 2 * 8; }",
        &OperatorRegistry::with_builtins(),
    )
    .unwrap();
    let rule = rules.get("t").unwrap();

    let x = rule.vars()["x"].as_value().unwrap();
    assert_eq!(x.as_number().unwrap().get(), 151);

    // Only the constant subtree folds.
    match &rule.vars()["y"] {
        Expr::Binary { op, right, .. } => {
            assert_eq!(*op, BinaryOp::Add);
            assert_eq!(right.as_value().unwrap().as_number().unwrap().get(), 16);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_simplify_is_idempotent() {
    let negated = Expr::unary(
        UnaryOp::Neg,
        Expr::Value(Number::signed(100, Width::W4).into()),
    );
    let once = negated.simplify().unwrap().into_owned();
    assert_eq!(once, Expr::Value(Number::signed(-100, Width::W4).into()));
    assert_eq!(once.simplify().unwrap().into_owned(), once);

    let mixed = Expr::binary(
        BinaryOp::Mul,
        Expr::variable("n"),
        Expr::binary(BinaryOp::Add, Expr::number(1), Expr::number(2)),
    );
    let once = mixed.simplify().unwrap().into_owned();
    assert_eq!(once.simplify().unwrap().into_owned(), once);
}

#[test]
fn test_first_false_condition_stops_evaluation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut operators = OperatorRegistry::with_builtins();
    let counter = calls.clone();
    operators
        .register_fn("Probe", Signature::new([]).variadic(Kind::Any), move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Primitive::Bool(true))
        })
        .unwrap();

    let result = evaluate(
        "rule t { if Byte(0) == 9; if Probe(); Probe(); }",
        DATA,
        &operators,
    )
    .unwrap();
    assert!(result.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The right operand of a decided && is never evaluated either.
    let result = evaluate("rule t { if false && Probe(); }", DATA, &operators).unwrap();
    assert!(result.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_slice_bounds() {
    let m = matched(r#"rule t { var s = "abc"[1:3]; var c = String(0, 3)[2]; }"#, b"xyz");
    assert_eq!(m.vars["s"], Primitive::from("bc"));
    assert!(m.vars.contains_key("c"));

    let operators = OperatorRegistry::with_builtins();
    let rules = RuleSet::default();
    let source = SeekSource::new(Cursor::new(Vec::new())).unwrap();
    let mut env = Environment::new(&rules, &operators, source);
    let slice = Expr::Slice {
        expr: Box::new(Expr::string("abc")),
        start: Box::new(Expr::number(5)),
        end: None,
    };
    assert!(matches!(slice.evaluate(&mut env), Err(Error::OutOfRange { .. })));

    // Out of range at evaluation time fails the rule instance only.
    let result = evaluate(r#"rule t { var c = String(0, 3)[5]; }"#, b"xyz", &operators);
    assert!(matches!(result, Err(Error::OutOfRange { .. })));
}

#[test]
fn test_globals_resolve_from_register() {
    let operators = OperatorRegistry::with_builtins();
    let rules = RuleSet::parse(
        "test.sift",
        "rule t { var n = $limit + 1; if n == 5; }",
        &operators,
    )
    .unwrap();
    let source = SeekSource::new(Cursor::new(Vec::new())).unwrap();
    let mut globals = sift_core::Register::new();
    globals.set("$limit", Number::literal(4));
    let mut env = Environment::new(&rules, &operators, source).with_globals(globals);
    let m = env.evaluate_rule(rules.roots()[0]).unwrap().unwrap();
    assert_eq!(num(&m, "n"), 5);
}

#[test]
fn test_parse_errors_abort_loading() {
    let operators = OperatorRegistry::with_builtins();
    let err = RuleSet::parse("bad.sift", "rule t {\n  var x = ;\n}", &operators).unwrap_err();
    match err {
        Error::Parse {
            source_name, line, ..
        } => {
            assert_eq!(source_name, "bad.sift");
            assert_eq!(line, 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    assert!(matches!(
        RuleSet::parse("bad.sift", "rule t { Missing(); }", &operators),
        Err(Error::Parse { .. })
    ));
    assert!(matches!(
        RuleSet::parse("bad.sift", "rule a : b { } rule b : a { }", &operators),
        Err(Error::InheritanceCycle { .. })
    ));
}
