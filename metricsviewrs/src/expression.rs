//! Boolean filter expressions accepted by `where` and `having` clauses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A filter expression tree.
///
/// Serialized as an externally tagged enum, e.g.
/// `{"cond": {"op": "in", "exprs": [{"ident": "country"}, {"val": "US"}]}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    #[serde(rename = "ident")]
    Identifier(String),
    #[serde(rename = "val")]
    Literal(Value),
    #[serde(rename = "cond")]
    Condition(Condition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub op: Operator,
    #[serde(default)]
    pub exprs: Vec<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    And,
    Or,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    #[serde(alias = "nin")]
    NotIn,
    #[serde(alias = "ilike")]
    Like,
    #[serde(alias = "nilike")]
    NotLike,
}

impl Operator {
    pub fn comparison_sql(&self) -> Option<&'static str> {
        match self {
            Operator::Eq => Some("="),
            Operator::Neq => Some("!="),
            Operator::Lt => Some("<"),
            Operator::Lte => Some("<="),
            Operator::Gt => Some(">"),
            Operator::Gte => Some(">="),
            _ => None,
        }
    }
}

impl Expression {
    pub fn ident(name: impl Into<String>) -> Self {
        Expression::Identifier(name.into())
    }

    pub fn value(v: impl Into<Value>) -> Self {
        Expression::Literal(v.into())
    }

    pub fn null() -> Self {
        Expression::Literal(Value::Null)
    }

    pub fn cond(op: Operator, exprs: Vec<Expression>) -> Self {
        Expression::Condition(Condition { op, exprs })
    }

    pub fn and(exprs: Vec<Expression>) -> Self {
        Self::cond(Operator::And, exprs)
    }

    pub fn or(exprs: Vec<Expression>) -> Self {
        Self::cond(Operator::Or, exprs)
    }

    pub fn eq(name: &str, v: impl Into<Value>) -> Self {
        Self::cond(Operator::Eq, vec![Self::ident(name), Self::value(v)])
    }

    pub fn in_list(name: &str, values: Vec<Value>) -> Self {
        let mut exprs = vec![Self::ident(name)];
        exprs.extend(values.into_iter().map(Expression::Literal));
        Self::cond(Operator::In, exprs)
    }

    pub fn not_in_list(name: &str, values: Vec<Value>) -> Self {
        let mut exprs = vec![Self::ident(name)];
        exprs.extend(values.into_iter().map(Expression::Literal));
        Self::cond(Operator::NotIn, exprs)
    }

    pub fn like(name: &str, pattern: &str) -> Self {
        Self::cond(Operator::Like, vec![Self::ident(name), Self::value(pattern)])
    }

    /// AND two optional expressions, keeping whichever side is present.
    pub fn and_opt(left: Option<Expression>, right: Option<Expression>) -> Option<Expression> {
        match (left, right) {
            (Some(l), Some(r)) => Some(Self::and(vec![l, r])),
            (l, r) => l.or(r),
        }
    }

    /// Every identifier referenced anywhere in the tree.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expression::Identifier(name) => out.push(name),
            Expression::Literal(_) => {}
            Expression::Condition(cond) => {
                for e in &cond.exprs {
                    e.collect_identifiers(out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_tagged_tree() {
        let raw = json!({
            "cond": {
                "op": "and",
                "exprs": [
                    {"cond": {"op": "nin", "exprs": [{"ident": "pub"}, {"val": "A"}, {"val": null}]}},
                    {"cond": {"op": "ilike", "exprs": [{"ident": "dom"}, {"val": "%x%"}]}}
                ]
            }
        });
        let expr: Expression = serde_json::from_value(raw).unwrap();
        let expected = Expression::and(vec![
            Expression::not_in_list("pub", vec![json!("A"), Value::Null]),
            Expression::like("dom", "%x%"),
        ]);
        assert_eq!(expr, expected);
        assert_eq!(expr.identifiers(), vec!["pub", "dom"]);
    }

    #[test]
    fn and_opt_keeps_present_side() {
        let a = Expression::eq("a", 1);
        assert_eq!(Expression::and_opt(Some(a.clone()), None), Some(a.clone()));
        assert_eq!(Expression::and_opt(None, None), None);
        assert!(matches!(
            Expression::and_opt(Some(a.clone()), Some(a)),
            Some(Expression::Condition(Condition { op: Operator::And, .. }))
        ));
    }
}
