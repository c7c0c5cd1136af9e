#![allow(clippy::result_large_err)] // Evaluators return AppError so template failures keep their structured code.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::schema::ExpressionLanguage;
use regex::Regex;
use rhai::{Array, Dynamic, Engine, Map, Scope};
use serde_json::{Map as JsonMap, Number, Value};
use std::sync::{Arc, OnceLock};

pub(crate) fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").expect("placeholder regex"))
}

fn identifier_regex() -> &'static Regex {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"))
}

/// Contract shared by every expression grammar the interpreter can be configured with.
///
/// `scope` is a JSON object; its keys are the names an expression can reference.
pub trait ExpressionEvaluator: Send + Sync {
    fn language(&self) -> ExpressionLanguage;

    /// Parse-check an expression without evaluating it.
    fn check(&self, expr: &str) -> Result<(), AppError>;

    /// Evaluate an expression against the scope.
    fn evaluate(&self, expr: &str, scope: &Value) -> Result<Value, AppError>;

    /// Evaluate an expression and coerce the result to a boolean.
    fn evaluate_condition(&self, expr: &str, scope: &Value) -> Result<bool, AppError> {
        Ok(truthy(&self.evaluate(expr, scope)?))
    }

    /// Render a template value.
    ///
    /// Strings are scanned for `{{ ... }}` placeholders. A string that is exactly one
    /// placeholder yields the referenced value with its original type; anything else is
    /// interpolated as text. Objects of the form `{"$expr": "..."}` are evaluated directly.
    fn render(&self, template: &Value, scope: &Value) -> Result<Value, AppError> {
        match template {
            Value::String(text) => self.render_str(text, scope),
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(expr)) = map.get("$expr") {
                        return self.evaluate(expr, scope);
                    }
                }
                let mut rendered = JsonMap::new();
                for (key, child) in map {
                    rendered.insert(key.clone(), self.render(child, scope)?);
                }
                Ok(Value::Object(rendered))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn render_str(&self, text: &str, scope: &Value) -> Result<Value, AppError> {
        let regex = placeholder_regex();
        let trimmed = text.trim();
        if let Some(caps) = regex.captures(trimmed) {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            if whole.len() == trimmed.len() {
                let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                return self.evaluate(expr, scope).map_err(|err| template_error(text, err));
            }
        } else {
            return Ok(Value::String(text.to_string()));
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in regex.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            out.push_str(&text[last..whole.start()]);
            let value = self
                .evaluate(expr, scope)
                .map_err(|err| template_error(text, err))?;
            out.push_str(&stringify(&value));
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(Value::String(out))
    }
}

fn template_error(template: &str, err: AppError) -> AppError {
    AppError::new(
        ErrorCategory::ValidationError,
        format!("template '{}' failed: {}", template, err.message),
    )
    .with_code("WFG-TPL-001")
}

/// Text form used when a value is spliced into a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truthiness used for conditions: null, false, 0, "" and empty collections are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Adapter lookup keyed by the configured language tag.
pub fn evaluator_for(language: ExpressionLanguage) -> Arc<dyn ExpressionEvaluator> {
    match language {
        ExpressionLanguage::Rhai => Arc::new(RhaiEvaluator::default()),
        ExpressionLanguage::Simple => Arc::new(SimpleEvaluator),
    }
}

/// Full expression language backed by a locked-down Rhai engine.
pub struct RhaiEvaluator {
    engine: Engine,
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        let mut engine = Engine::new_raw();
        engine.set_max_operations(50_000);
        engine.set_max_call_levels(64);
        engine.set_max_expr_depths(64, 64);
        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});
        // Unknown variables read as unit so conditions over absent keys are simply false.
        engine.on_var(|name, index, context| {
            if index > 0 || context.scope().contains(name) {
                Ok(None)
            } else {
                Ok(Some(Dynamic::UNIT))
            }
        });
        RhaiEvaluator { engine }
    }
}

impl RhaiEvaluator {
    fn scope_for(scope: &Value) -> Scope<'static> {
        let mut rhai_scope = Scope::new();
        rhai_scope.push_dynamic("context", to_dynamic(scope));
        if let Value::Object(map) = scope {
            for (key, value) in map {
                if key != "context" && identifier_regex().is_match(key) {
                    rhai_scope.push_dynamic(key.clone(), to_dynamic(value));
                }
            }
        }
        rhai_scope
    }
}

impl ExpressionEvaluator for RhaiEvaluator {
    fn language(&self) -> ExpressionLanguage {
        ExpressionLanguage::Rhai
    }

    fn check(&self, expr: &str) -> Result<(), AppError> {
        self.engine.compile_expression(expr).map(|_| ()).map_err(|err| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("expression compile error in '{}': {}", expr, err),
            )
            .with_code("WFG-EXPR-001")
        })
    }

    fn evaluate(&self, expr: &str, scope: &Value) -> Result<Value, AppError> {
        let mut rhai_scope = Self::scope_for(scope);
        let result = self
            .engine
            .eval_expression_with_scope::<Dynamic>(&mut rhai_scope, expr)
            .map_err(|err| {
                AppError::new(
                    ErrorCategory::ValidationError,
                    format!("expression execution error in '{}': {}", expr, err),
                )
                .with_code("WFG-EXPR-002")
            })?;
        Ok(from_dynamic(result))
    }
}

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::from(0_i64)
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let arr: Array = items.iter().map(to_dynamic).collect();
            Dynamic::from_array(arr)
        }
        Value::Object(map) => {
            let mut rhai_map = Map::new();
            for (key, value) in map {
                rhai_map.insert(key.into(), to_dynamic(value));
            }
            Dynamic::from_map(rhai_map)
        }
    }
}

fn from_dynamic(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Value::Bool(b);
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Value::Number(Number::from(i));
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        if let Some(num) = Number::from_f64(f) {
            return Value::Number(num);
        }
    }
    if let Some(s) = value.clone().try_cast::<String>() {
        return Value::String(s);
    }
    if let Some(arr) = value.clone().try_cast::<Array>() {
        return Value::Array(arr.into_iter().map(from_dynamic).collect());
    }
    if let Some(map) = value.try_cast::<Map>() {
        let mut json_map = JsonMap::new();
        for (key, value) in map {
            json_map.insert(key.into(), from_dynamic(value));
        }
        return Value::Object(json_map);
    }
    Value::Null
}

/// Minimal comparison language: literals, dotted paths, comparisons and boolean combinators.
pub struct SimpleEvaluator;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    LParen,
    RParen,
    Op(CmpOp),
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

fn simple_error(expr: &str, message: impl std::fmt::Display) -> AppError {
    AppError::new(
        ErrorCategory::ValidationError,
        format!("expression compile error in '{}': {}", expr, message),
    )
    .with_code("WFG-EXPR-001")
}

fn tokenize(expr: &str) -> Result<Vec<Token>, AppError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                    }
                    text.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(simple_error(expr, "unterminated string literal"));
                }
                i += 1;
                tokens.push(Token::Str(text));
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CmpOp::Eq), 2),
                    ('!', Some('=')) => (Token::Op(CmpOp::Ne), 2),
                    ('<', Some('=')) => (Token::Op(CmpOp::Le), 2),
                    ('>', Some('=')) => (Token::Op(CmpOp::Ge), 2),
                    ('<', _) => (Token::Op(CmpOp::Lt), 1),
                    ('>', _) => (Token::Op(CmpOp::Gt), 1),
                    ('!', _) => (Token::Not, 1),
                    _ => return Err(simple_error(expr, "single '=' is not an operator")),
                };
                tokens.push(token);
                i += width;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(simple_error(expr, format!("expected '{c}{c}'")));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                // A dot only continues the literal when a digit follows, so `items.0.x` stays a path.
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || (chars[i] == '.'
                            && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())
                            && !matches!(tokens.last(), Some(Token::Dot))))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if matches!(tokens.last(), Some(Token::Dot)) {
                    tokens.push(Token::Ident(text));
                } else {
                    let number = text
                        .parse::<f64>()
                        .map_err(|_| simple_error(expr, format!("invalid number '{}'", text)))?;
                    tokens.push(Token::Number(number));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(simple_error(expr, format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse(source: &'a str) -> Result<Expr, AppError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(simple_error(source, "unexpected trailing tokens"));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, AppError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, AppError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, AppError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, AppError> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, AppError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(simple_error(self.source, "missing ')'")),
                }
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    let mut segments = vec![word];
                    while self.peek() == Some(&Token::Dot) {
                        self.pos += 1;
                        match self.next() {
                            Some(Token::Ident(segment)) => segments.push(segment),
                            _ => return Err(simple_error(self.source, "expected path segment")),
                        }
                    }
                    Ok(Expr::Path(segments))
                }
            },
            _ => Err(simple_error(self.source, "expected a value")),
        }
    }
}

fn lookup_path(scope: &Value, segments: &[String]) -> Value {
    let mut current = scope;
    for (index, segment) in segments.iter().enumerate() {
        // `context.x` addresses the whole scope, matching the rhai binding.
        if index == 0 && segment == "context" && scope.get("context").is_none() {
            continue;
        }
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        _ => {
            let ordering = match (left, right) {
                (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
                _ => match (left.as_f64(), right.as_f64()) {
                    (Some(l), Some(r)) => l.partial_cmp(&r),
                    _ => None,
                },
            };
            // Incomparable operands never satisfy an ordering.
            match ordering {
                Some(ord) => match op {
                    CmpOp::Lt => ord.is_lt(),
                    CmpOp::Le => ord.is_le(),
                    CmpOp::Gt => ord.is_gt(),
                    CmpOp::Ge => ord.is_ge(),
                    CmpOp::Eq | CmpOp::Ne => unreachable!(),
                },
                None => false,
            }
        }
    }
}

fn eval_simple(expr: &Expr, scope: &Value) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Path(segments) => lookup_path(scope, segments),
        Expr::Not(inner) => Value::Bool(!truthy(&eval_simple(inner, scope))),
        Expr::And(l, r) => {
            Value::Bool(truthy(&eval_simple(l, scope)) && truthy(&eval_simple(r, scope)))
        }
        Expr::Or(l, r) => {
            Value::Bool(truthy(&eval_simple(l, scope)) || truthy(&eval_simple(r, scope)))
        }
        Expr::Compare(op, l, r) => {
            Value::Bool(compare(*op, &eval_simple(l, scope), &eval_simple(r, scope)))
        }
    }
}

impl ExpressionEvaluator for SimpleEvaluator {
    fn language(&self) -> ExpressionLanguage {
        ExpressionLanguage::Simple
    }

    fn check(&self, expr: &str) -> Result<(), AppError> {
        Parser::parse(expr).map(|_| ())
    }

    fn evaluate(&self, expr: &str, scope: &Value) -> Result<Value, AppError> {
        let parsed = Parser::parse(expr)?;
        Ok(eval_simple(&parsed, scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluators() -> Vec<Arc<dyn ExpressionEvaluator>> {
        vec![
            evaluator_for(ExpressionLanguage::Rhai),
            evaluator_for(ExpressionLanguage::Simple),
        ]
    }

    #[test]
    fn both_grammars_agree_on_comparisons() {
        let scope = json!({"score": 9, "user": {"name": "ada", "age": 36}});
        for evaluator in evaluators() {
            assert!(evaluator.evaluate_condition("score >= 8", &scope).unwrap());
            assert!(!evaluator.evaluate_condition("score < 8", &scope).unwrap());
            assert!(evaluator
                .evaluate_condition("user.name == \"ada\" && user.age > 30", &scope)
                .unwrap());
            assert!(evaluator
                .evaluate_condition("score == 1 || user.age != 35", &scope)
                .unwrap());
        }
    }

    #[test]
    fn missing_keys_are_falsy() {
        let scope = json!({});
        for evaluator in evaluators() {
            assert!(!evaluator.evaluate_condition("approved", &scope).unwrap());
        }
    }

    #[test]
    fn single_placeholder_keeps_type() {
        let scope = json!({"items": [1, 2, 3], "limit": 4, "meta": {"a": true}});
        for evaluator in evaluators() {
            assert_eq!(
                evaluator.render(&json!("{{ items }}"), &scope).unwrap(),
                json!([1, 2, 3])
            );
            assert_eq!(evaluator.render(&json!("{{limit}}"), &scope).unwrap(), json!(4));
            assert_eq!(
                evaluator.render(&json!("  {{ meta }} "), &scope).unwrap(),
                json!({"a": true})
            );
        }
    }

    #[test]
    fn mixed_templates_are_stringified() {
        let scope = json!({"name": "ada", "count": 2});
        for evaluator in evaluators() {
            assert_eq!(
                evaluator
                    .render(&json!("hi {{ name }}, you have {{ count }}"), &scope)
                    .unwrap(),
                json!("hi ada, you have 2")
            );
        }
    }

    #[test]
    fn renders_nested_structures_and_expr_objects() {
        let scope = json!({"a": 2});
        let evaluator = evaluator_for(ExpressionLanguage::Rhai);
        let rendered = evaluator
            .render(
                &json!({"x": ["{{ a }}", {"$expr": "a * 10"}], "plain": 7}),
                &scope,
            )
            .unwrap();
        assert_eq!(rendered, json!({"x": [2, 20], "plain": 7}));
    }

    #[test]
    fn simple_grammar_indexes_arrays_and_negates() {
        let scope = json!({"items": [{"ok": false}, {"ok": true}]});
        let evaluator = SimpleEvaluator;
        assert_eq!(evaluator.evaluate("items.1.ok", &scope).unwrap(), json!(true));
        assert!(evaluator.evaluate_condition("not items.0.ok", &scope).unwrap());
        assert!(evaluator
            .evaluate_condition("!(items.0.ok or false)", &scope)
            .unwrap());
    }

    #[test]
    fn simple_grammar_rejects_garbage() {
        let evaluator = SimpleEvaluator;
        assert!(evaluator.check("score >= ").is_err());
        assert!(evaluator.check("a = b").is_err());
        assert!(evaluator.check("(a").is_err());
        assert!(evaluator.check("score >= 8 and done").is_ok());
    }

    #[test]
    fn rhai_rejects_statements() {
        let evaluator = RhaiEvaluator::default();
        assert!(evaluator.check("let x = 1").is_err());
        assert!(evaluator.check("score >= 8").is_ok());
    }
}
