//! Safe expression evaluation for edge conditions and step guards.
//!
//! The grammar is closed: property access on the state tree, the eight
//! comparison operators, `&&` / `||`, and literals. Nothing here ever
//! executes code from the expression source; a denylisted identifier
//! anywhere in the source aborts evaluation.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use cortex_core::error::{CortexError, Result};
use cortex_core::state::RuntimeState;
use cortex_core::types::FALLBACK_KEY;

/// Identifiers that abort evaluation outright.
const FORBIDDEN: &[&str] = &[
    "eval",
    "Function",
    "constructor",
    "prototype",
    "__proto__",
    "globalThis",
    "process",
    "require",
    "import",
    "Reflect",
    "Proxy",
];

/// Evaluate an expression against the state tree, returning its value.
pub fn evaluate(source: &str, state: &RuntimeState) -> Result<Value> {
    check_denylist(source)?;
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.parse_or(state)?;
    if parser.pos != parser.tokens.len() {
        return Err(CortexError::ExpressionUnsafe(format!(
            "trailing input in expression: {}",
            source
        )));
    }
    Ok(value)
}

/// Evaluate a step-level condition, coerced to boolean. Malformed or unsafe
/// conditions are false (the step is skipped).
pub fn evaluate_condition(source: &str, state: &RuntimeState) -> bool {
    match evaluate(source, state) {
        Ok(value) => truthy(&value),
        Err(e) => {
            warn!(expression = source, error = %e, "Condition evaluation failed, treating as false");
            false
        }
    }
}

/// Resolve a conditional edge: evaluate `condition` and map the result onto
/// the `targets` table, first by key, then by value. Anything else —
/// including an unsafe or malformed expression — is `__fallback__`.
pub fn resolve_branch(
    condition: &str,
    state: &RuntimeState,
    targets: &BTreeMap<String, String>,
) -> String {
    let value = match evaluate(condition, state) {
        Ok(v) => v,
        Err(e) => {
            warn!(expression = condition, error = %e, "Branch condition rejected, taking fallback");
            return FALLBACK_KEY.to_string();
        }
    };

    let text = value_text(&value);
    if targets.contains_key(&text) {
        return text;
    }
    if let Some((key, _)) = targets.iter().find(|(_, v)| **v == text) {
        return key.clone();
    }

    debug!(expression = condition, result = %text, "Branch result matched no target");
    FALLBACK_KEY.to_string()
}

/// JavaScript-style truthiness over JSON values.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn check_denylist(source: &str) -> Result<()> {
    for ident in identifiers(source) {
        if FORBIDDEN.contains(&ident.as_str()) {
            return Err(CortexError::ExpressionUnsafe(format!(
                "forbidden identifier '{}'",
                ident
            )));
        }
    }
    Ok(())
}

/// Split the raw source into identifier-ish words, including the segments of
/// dotted paths, so `a.constructor.b` is caught.
fn identifiers(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_string: Option<char> = None;

    for c in source.chars() {
        if let Some(quote) = in_string {
            if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => in_string = Some(c),
            c if c.is_alphanumeric() || c == '_' || c == '$' => current.push(c),
            _ => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Op(Cmp),
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cmp {
    StrictEq,
    StrictNe,
    LooseEq,
    LooseNe,
    Gt,
    Lt,
    Ge,
    Le,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let bytes: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let malformed =
        |what: &str| CortexError::ExpressionUnsafe(format!("{} in expression: {}", what, source));

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '&' => {
                if bytes.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(malformed("single '&'"));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(malformed("single '|'"));
                }
            }
            '=' | '!' => {
                let negated = c == '!';
                if bytes.get(i + 1) != Some(&'=') {
                    return Err(malformed("bare '=' or '!'"));
                }
                if bytes.get(i + 2) == Some(&'=') {
                    tokens.push(Token::Op(if negated { Cmp::StrictNe } else { Cmp::StrictEq }));
                    i += 3;
                } else {
                    tokens.push(Token::Op(if negated { Cmp::LooseNe } else { Cmp::LooseEq }));
                    i += 2;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(Cmp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(Cmp::Gt));
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(Cmp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(Cmp::Lt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(malformed("unterminated string")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-' && bytes.get(i + 1).is_some_and(|d| d.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == '.') {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| malformed("invalid number"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_alphanumeric() || bytes[i] == '_' || bytes[i] == '$' || bytes[i] == '.')
                {
                    i += 1;
                }
                let word: String = bytes[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" | "undefined" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Path(word)),
                }
            }
            _ => return Err(malformed(&format!("unexpected character '{}'", c))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self, state: &RuntimeState) -> Result<Value> {
        let mut left = self.parse_and(state)?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and(state)?;
            // Short-circuit value semantics: the first truthy operand wins.
            if !truthy(&left) {
                left = right;
            }
        }
        Ok(left)
    }

    fn parse_and(&mut self, state: &RuntimeState) -> Result<Value> {
        let mut left = self.parse_cmp(state)?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let right = self.parse_cmp(state)?;
            if truthy(&left) {
                left = right;
            }
        }
        Ok(left)
    }

    fn parse_cmp(&mut self, state: &RuntimeState) -> Result<Value> {
        let left = self.parse_primary(state)?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let right = self.parse_primary(state)?;
            return Ok(Value::Bool(compare(op, &left, &right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self, state: &RuntimeState) -> Result<Value> {
        match self.next() {
            Some(Token::Number(n)) => Ok(number_value(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Path(path)) => {
                // Bare paths are auto-prefixed with `state.`.
                let path = path.strip_prefix("state.").unwrap_or(&path);
                Ok(state.lookup(path).unwrap_or(Value::Null))
            }
            other => Err(CortexError::ExpressionUnsafe(format!(
                "expected operand, found {:?}",
                other
            ))),
        }
    }
}

/// Integral literals stay JSON integers so stored values compare cleanly.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn compare(op: Cmp, left: &Value, right: &Value) -> bool {
    match op {
        Cmp::StrictEq => strict_eq(left, right),
        Cmp::StrictNe => !strict_eq(left, right),
        Cmp::LooseEq => loose_eq(left, right),
        Cmp::LooseNe => !loose_eq(left, right),
        Cmp::Gt | Cmp::Lt | Cmp::Ge | Cmp::Le => {
            let Some(ord) = ordering(left, right) else {
                return false;
            };
            match op {
                Cmp::Gt => ord.is_gt(),
                Cmp::Lt => ord.is_lt(),
                Cmp::Ge => ord.is_ge(),
                Cmp::Le => ord.is_le(),
                _ => unreachable!(),
            }
        }
    }
}

fn strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).is_some_and(|(a, b)| a == b)
        }
        (a, b) => a == b,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if strict_eq(left, right) {
        return true;
    }
    // Cross-type comparison coerces through text, numbers first.
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a == b;
    }
    value_text(left) == value_text(right)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a.partial_cmp(&b);
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_core::state::QueryInput;
    use serde_json::json;

    fn state() -> RuntimeState {
        let mut s = RuntimeState::new(QueryInput { message: "hi".into() }, "u1", 4);
        s.data.insert("routeDecision".into(), json!("plan"));
        s.data.insert("count".into(), json!(3));
        s.data.insert("flag".into(), json!(true));
        s.data.insert("name".into(), json!("cortex"));
        s
    }

    #[test]
    fn test_property_access() {
        let s = state();
        assert_eq!(evaluate("state.data.routeDecision", &s).unwrap(), json!("plan"));
        // Bare paths are auto-prefixed with state.
        assert_eq!(evaluate("data.count", &s).unwrap(), json!(3));
    }

    #[test]
    fn test_comparisons() {
        let s = state();
        assert_eq!(evaluate("data.count > 2", &s).unwrap(), json!(true));
        assert_eq!(evaluate("data.count >= 3", &s).unwrap(), json!(true));
        assert_eq!(evaluate("data.count < 3", &s).unwrap(), json!(false));
        assert_eq!(
            evaluate("data.name === 'cortex'", &s).unwrap(),
            json!(true)
        );
        assert_eq!(evaluate("data.name !== \"other\"", &s).unwrap(), json!(true));
        // Loose equality coerces across types; strict does not.
        assert_eq!(evaluate("data.count == '3'", &s).unwrap(), json!(true));
        assert_eq!(evaluate("data.count === '3'", &s).unwrap(), json!(false));
    }

    #[test]
    fn test_boolean_composition() {
        let s = state();
        assert_eq!(
            evaluate("data.flag && data.count > 1", &s).unwrap(),
            json!(true)
        );
        assert_eq!(
            evaluate("data.count > 10 || data.name === 'cortex'", &s).unwrap(),
            json!(true)
        );
        assert_eq!(
            evaluate("data.count > 10 && data.flag", &s).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn test_missing_path_is_null() {
        let s = state();
        assert_eq!(evaluate("data.absent", &s).unwrap(), Value::Null);
        assert_eq!(evaluate("data.absent == null", &s).unwrap(), json!(true));
        assert!(!evaluate_condition("data.absent", &s));
    }

    #[test]
    fn test_forbidden_identifiers_rejected() {
        let s = state();
        for source in [
            "constructor",
            "data.constructor.name === 'x'",
            "__proto__ == null",
            "eval && true",
            "a.prototype.b > 1",
            "process.env",
        ] {
            assert!(
                matches!(evaluate(source, &s), Err(CortexError::ExpressionUnsafe(_))),
                "should reject: {}",
                source
            );
        }
        // A quoted string may mention them; only identifiers are checked.
        assert_eq!(
            evaluate("data.name === 'constructor'", &s).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn test_malformed_condition_is_false() {
        let s = state();
        assert!(!evaluate_condition("data.count >", &s));
        assert!(!evaluate_condition("&& true", &s));
        assert!(!evaluate_condition("data.count = 3", &s));
    }

    #[test]
    fn test_resolve_branch() {
        let s = state();
        let targets: BTreeMap<String, String> = [
            ("direct".to_string(), "respond".to_string()),
            ("plan".to_string(), "planner".to_string()),
        ]
        .into_iter()
        .collect();

        // Result matches a key.
        assert_eq!(resolve_branch("state.data.routeDecision", &s, &targets), "plan");
        // Result matches a value: mapped back to its key.
        assert_eq!(resolve_branch("'planner'", &s, &targets), "plan");
        // Anything else falls back.
        assert_eq!(resolve_branch("'maybe'", &s, &targets), FALLBACK_KEY);
        // Unsafe expressions fall back without evaluation.
        assert_eq!(resolve_branch("constructor", &s, &targets), FALLBACK_KEY);
    }

    #[test]
    fn test_boolean_branch_result() {
        let s = state();
        let targets: BTreeMap<String, String> =
            [("true".to_string(), "yes".to_string()), ("false".to_string(), "no".to_string())]
                .into_iter()
                .collect();
        assert_eq!(resolve_branch("data.count > 1", &s, &targets), "true");
        assert_eq!(resolve_branch("data.count > 9", &s, &targets), "false");
    }
}
