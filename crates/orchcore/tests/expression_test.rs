use orchcore::{Evaluation, ExpressionEvaluator};
use serde_json::{json, Value};
use std::collections::HashMap;

fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn substitutes_known_placeholders_and_keeps_unknown_ones() {
    let evaluator = ExpressionEvaluator::new();
    let variables = vars(&[("name", json!("Ada")), ("count", json!(3))]);

    assert_eq!(
        evaluator.substitute("Hello ${name}, you have ${count} items from ${missing}", &variables),
        "Hello Ada, you have 3 items from ${missing}"
    );
}

#[test]
fn substitution_walks_dotted_paths() {
    let evaluator = ExpressionEvaluator::new();
    let variables = vars(&[("order", json!({"customer": {"email": "a@b.c"}}))]);

    assert_eq!(evaluator.substitute("${order.customer.email}", &variables), "a@b.c");
}

#[test]
fn truth_words_short_circuit_parsing() {
    let evaluator = ExpressionEvaluator::new();
    let empty = HashMap::new();

    for word in ["true", "YES", "1", " True "] {
        assert_eq!(evaluator.evaluate(word, &empty), json!(true), "{word}");
    }
    for word in ["false", "No", "0"] {
        assert_eq!(evaluator.evaluate(word, &empty), json!(false), "{word}");
    }

    let variables = vars(&[("approved", json!("yes"))]);
    assert_eq!(evaluator.evaluate("${approved}", &variables), json!(true));
}

#[test]
fn comparisons_and_boolean_operators() {
    let evaluator = ExpressionEvaluator::new();
    let variables = vars(&[("amount", json!(1500)), ("status", json!("approved"))]);

    assert_eq!(evaluator.evaluate("2 > 1", &HashMap::new()), json!(true));
    assert_eq!(evaluator.evaluate("${amount} >= 1000 and status == 'approved'", &variables), json!(true));
    assert_eq!(evaluator.evaluate("amount < 100 or not (status != 'approved')", &variables), json!(true));
    assert_eq!(evaluator.evaluate("1 < amount < 1000", &variables), json!(false));
    assert_eq!(evaluator.evaluate("amount == 1500.0", &variables), json!(true));
}

#[test]
fn arithmetic_follows_integer_and_float_rules() {
    let evaluator = ExpressionEvaluator::new();
    let variables = vars(&[("price", json!(20)), ("qty", json!(3))]);

    assert_eq!(evaluator.evaluate("price * qty + 5", &variables), json!(65));
    assert_eq!(evaluator.evaluate("7 / 2", &variables), json!(3.5));
    assert_eq!(evaluator.evaluate("-7 % 3", &variables), json!(2));
    assert_eq!(evaluator.evaluate("'ab' + 'cd'", &variables), json!("abcd"));
}

#[test]
fn failures_return_substituted_text() {
    let evaluator = ExpressionEvaluator::new();
    let variables = vars(&[("x", json!(5))]);

    let cases = [
        ("${x} / 0", "5 / 0"),
        ("__import__('os')", "__import__('os')"),
        ("x.__class__", "x.__class__"),
        ("unknown_var > 1", "unknown_var > 1"),
        ("'a' < 1", "'a' < 1"),
        ("John Smith", "John Smith"),
        ("", ""),
    ];
    for (expr, expected) in cases {
        assert_eq!(
            evaluator.evaluate_detailed(expr, &variables),
            Evaluation::Unevaluated(expected.to_string()),
            "{expr}"
        );
    }
}

#[test]
fn condition_reports_unevaluable_text_as_none() {
    let evaluator = ExpressionEvaluator::new();
    let variables = vars(&[("score", json!(80))]);

    assert_eq!(evaluator.evaluate_condition("score > 50", &variables), Some(true));
    assert_eq!(evaluator.evaluate_condition("score", &variables), Some(true));
    assert_eq!(evaluator.evaluate_condition("score >", &variables), None);
}

#[test]
fn long_operator_chains_are_left_unevaluated() {
    let evaluator = ExpressionEvaluator::new();
    let chain = vec!["1"; 20_000].join("+");
    let variables = vars(&[("input", json!(vec!["x"; 20_000].join(" or ")))]);

    assert_eq!(
        evaluator.evaluate_detailed(&chain, &HashMap::new()),
        Evaluation::Unevaluated(chain.clone())
    );
    assert!(matches!(
        evaluator.evaluate_detailed("${input}", &variables),
        Evaluation::Unevaluated(_)
    ));
    assert_eq!(evaluator.evaluate_condition("${input}", &variables), None);

    let short = vec!["1"; 100].join(" + ");
    assert_eq!(evaluator.evaluate(&short, &HashMap::new()), json!(100));
}
