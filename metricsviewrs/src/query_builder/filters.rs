//! Compiles [`Expression`] trees into parameterized boolean SQL.

use std::collections::HashMap;

use serde_json::Value;

use crate::dialect::Dialect;
use crate::error::{MetricsViewError, Result};
use crate::expression::{Condition, Expression, Operator};
use crate::sql_ast::SqlFragment;

/// Suffixes of the synthetic columns a comparison query projects.
pub const COMPARISON_SUFFIXES: [&str; 3] = ["__previous", "__delta_abs", "__delta_rel"];

/// Maps a name used in a filter to the SQL it stands for.
pub trait ColumnResolver {
    fn resolve(&self, name: &str) -> Result<String>;
}

/// Resolves names against a fixed set of output columns (used for HAVING).
#[derive(Debug, Default)]
pub struct AliasResolver {
    columns: HashMap<String, String>,
}

impl AliasResolver {
    pub fn new(dialect: &dyn Dialect, aliases: impl IntoIterator<Item = String>) -> Self {
        let columns = aliases
            .into_iter()
            .map(|a| {
                let escaped = dialect.escape_identifier(&a);
                (a, escaped)
            })
            .collect();
        Self { columns }
    }
}

impl ColumnResolver for AliasResolver {
    fn resolve(&self, name: &str) -> Result<String> {
        if let Some(sql) = self.columns.get(name) {
            return Ok(sql.clone());
        }
        if COMPARISON_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return Err(MetricsViewError::UnknownColumnFilter(name.to_string()));
        }
        Err(MetricsViewError::UnknownReference {
            kind: "column",
            name: name.to_string(),
        })
    }
}

/// `lhs [NOT] ILIKE ?`, or its case-folded equivalent on engines without ILIKE.
pub fn like_predicate(dialect: &dyn Dialect, lhs: &str, rhs: &str, negate: bool) -> String {
    let not = if negate { "NOT " } else { "" };
    if !dialect.supports_ilike() {
        return format!("LOWER({lhs}) {not}LIKE LOWER({rhs})");
    }
    if dialect.requires_cast_for_like() {
        format!("{lhs}::TEXT {not}ILIKE {rhs}")
    } else {
        format!("{lhs} {not}ILIKE {rhs}")
    }
}

pub struct ExpressionCompiler<'a> {
    dialect: &'a dyn Dialect,
    resolver: &'a dyn ColumnResolver,
}

impl<'a> ExpressionCompiler<'a> {
    pub fn new(dialect: &'a dyn Dialect, resolver: &'a dyn ColumnResolver) -> Self {
        Self { dialect, resolver }
    }

    pub fn compile(&self, expr: &Expression) -> Result<SqlFragment> {
        match expr {
            Expression::Identifier(name) => Ok(SqlFragment::raw(self.resolver.resolve(name)?)),
            Expression::Literal(value) => Ok(SqlFragment::new("?", vec![value.clone()])),
            Expression::Condition(cond) => self.compile_condition(cond),
        }
    }

    fn compile_condition(&self, cond: &Condition) -> Result<SqlFragment> {
        match cond.op {
            Operator::And => self.compile_junction(&cond.exprs, " AND ", "TRUE"),
            Operator::Or => self.compile_junction(&cond.exprs, " OR ", "FALSE"),
            Operator::In | Operator::NotIn => self.compile_in(cond),
            Operator::Like | Operator::NotLike => self.compile_like(cond),
            op => {
                let Some(sql_op) = op.comparison_sql() else {
                    return Err(MetricsViewError::Unsupported(format!(
                        "operator {op:?} in filter"
                    )));
                };
                self.compile_comparison(cond, op, sql_op)
            }
        }
    }

    fn compile_junction(&self, exprs: &[Expression], sep: &str, empty: &str) -> Result<SqlFragment> {
        let mut sql = Vec::with_capacity(exprs.len());
        let mut args = Vec::new();
        for e in exprs {
            let part = self.compile(e)?;
            sql.push(format!("({})", part.sql));
            args.extend(part.args);
        }
        if sql.is_empty() {
            return Ok(SqlFragment::raw(empty));
        }
        Ok(SqlFragment::new(sql.join(sep), args))
    }

    fn compile_comparison(&self, cond: &Condition, op: Operator, sql_op: &str) -> Result<SqlFragment> {
        let [left, right] = cond.exprs.as_slice() else {
            return Err(MetricsViewError::Validation(format!(
                "{op:?} expects exactly two operands, got {}",
                cond.exprs.len()
            )));
        };
        let lhs = self.compile(left)?;
        if matches!(right, Expression::Literal(Value::Null)) {
            let test = match op {
                Operator::Eq => "IS NULL",
                Operator::Neq => "IS NOT NULL",
                _ => {
                    return Err(MetricsViewError::Validation(format!(
                        "{op:?} cannot compare against null"
                    )))
                }
            };
            return Ok(SqlFragment::new(format!("{} {test}", lhs.sql), lhs.args));
        }
        let rhs = self.compile(right)?;
        let mut args = lhs.args;
        args.extend(rhs.args);
        Ok(SqlFragment::new(format!("{} {sql_op} {}", lhs.sql, rhs.sql), args))
    }

    fn compile_in(&self, cond: &Condition) -> Result<SqlFragment> {
        let negate = cond.op == Operator::NotIn;
        let Some((left, candidates)) = cond.exprs.split_first() else {
            return Err(MetricsViewError::Validation(
                "IN expects the compared expression as its first operand".to_string(),
            ));
        };
        let lhs = self.compile(left)?;

        let mut has_null = false;
        let mut placeholders = Vec::new();
        let mut values = Vec::new();
        let mut push = |v: &Value, has_null: &mut bool| {
            if v.is_null() {
                *has_null = true;
            } else {
                placeholders.push("?".to_string());
                values.push(v.clone());
            }
        };
        let mut nested = Vec::new();
        for candidate in candidates {
            match candidate {
                Expression::Literal(Value::Array(items)) => {
                    items.iter().for_each(|v| push(v, &mut has_null));
                }
                Expression::Literal(v) => push(v, &mut has_null),
                other => nested.push(self.compile(other)?),
            }
        }
        for frag in nested {
            placeholders.push(frag.sql);
            values.extend(frag.args);
        }

        let l = &lhs.sql;
        let list_args = || {
            let mut args = lhs.args.clone();
            args.extend(values.iter().cloned());
            args
        };
        let list = placeholders.join(", ");
        let fragment = match (negate, placeholders.is_empty(), has_null) {
            (false, true, false) => SqlFragment::raw("FALSE"),
            (true, true, false) => SqlFragment::raw("TRUE"),
            (false, true, true) => SqlFragment::new(format!("{l} IS NULL"), lhs.args.clone()),
            (true, true, true) => SqlFragment::new(format!("{l} IS NOT NULL"), lhs.args.clone()),
            (false, false, false) => SqlFragment::new(format!("{l} IN ({list})"), list_args()),
            (false, false, true) => {
                let mut args = list_args();
                args.extend(lhs.args.iter().cloned());
                SqlFragment::new(format!("({l} IN ({list}) OR {l} IS NULL)"), args)
            }
            (true, false, true) => {
                let mut args = list_args();
                args.extend(lhs.args.iter().cloned());
                SqlFragment::new(format!("({l} NOT IN ({list}) AND {l} IS NOT NULL)"), args)
            }
            // NULL values were not excluded, so keep them.
            (true, false, false) => {
                let mut args = list_args();
                args.extend(lhs.args.iter().cloned());
                SqlFragment::new(format!("({l} NOT IN ({list}) OR {l} IS NULL)"), args)
            }
        };
        Ok(fragment)
    }

    fn compile_like(&self, cond: &Condition) -> Result<SqlFragment> {
        let negate = cond.op == Operator::NotLike;
        let [left, right] = cond.exprs.as_slice() else {
            return Err(MetricsViewError::Validation(format!(
                "LIKE expects exactly two operands, got {}",
                cond.exprs.len()
            )));
        };
        let lhs = self.compile(left)?;
        let rhs = self.compile(right)?;
        let predicate = like_predicate(self.dialect, &lhs.sql, &rhs.sql, negate);
        let mut args = lhs.args.clone();
        args.extend(rhs.args);
        if negate {
            args.extend(lhs.args);
            return Ok(SqlFragment::new(
                format!("({predicate} OR {} IS NULL)", lhs.sql),
                args,
            ));
        }
        Ok(SqlFragment::new(predicate, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{ClickHouseDialect, DruidDialect, DuckDbDialect};
    use serde_json::json;

    fn resolver() -> AliasResolver {
        AliasResolver::new(
            &DuckDbDialect,
            ["pub".to_string(), "dom".to_string(), "m".to_string()],
        )
    }

    fn compile(expr: &Expression) -> Result<SqlFragment> {
        let r = resolver();
        ExpressionCompiler::new(&DuckDbDialect, &r).compile(expr)
    }

    #[test]
    fn in_list_extracts_null() {
        let out = compile(&Expression::in_list("pub", vec![json!(1), Value::Null])).unwrap();
        assert_eq!(out.sql, "(\"pub\" IN (?) OR \"pub\" IS NULL)");
        assert_eq!(out.args, vec![json!(1)]);

        let out = compile(&Expression::not_in_list("pub", vec![json!(1), Value::Null])).unwrap();
        assert_eq!(out.sql, "(\"pub\" NOT IN (?) AND \"pub\" IS NOT NULL)");
        assert_eq!(out.args, vec![json!(1)]);
    }

    #[test]
    fn in_list_edge_cases() {
        assert_eq!(compile(&Expression::in_list("pub", vec![])).unwrap().sql, "FALSE");
        assert_eq!(compile(&Expression::not_in_list("pub", vec![])).unwrap().sql, "TRUE");
        assert_eq!(
            compile(&Expression::in_list("pub", vec![Value::Null])).unwrap().sql,
            "\"pub\" IS NULL"
        );
        assert_eq!(
            compile(&Expression::not_in_list("pub", vec![json!("a"), json!("b")]))
                .unwrap()
                .sql,
            "(\"pub\" NOT IN (?, ?) OR \"pub\" IS NULL)"
        );
        let array = Expression::cond(
            Operator::In,
            vec![Expression::ident("pub"), Expression::value(json!(["x", "y"]))],
        );
        let out = compile(&array).unwrap();
        assert_eq!(out.sql, "\"pub\" IN (?, ?)");
        assert_eq!(out.args, vec![json!("x"), json!("y")]);
    }

    #[test]
    fn junctions_parenthesize_children() {
        let expr = Expression::and(vec![
            Expression::eq("pub", "A"),
            Expression::or(vec![Expression::like("dom", "%g%"), Expression::eq("dom", Value::Null)]),
        ]);
        let out = compile(&expr).unwrap();
        assert_eq!(
            out.sql,
            "(\"pub\" = ?) AND ((\"dom\" ILIKE ?) OR (\"dom\" IS NULL))"
        );
        assert_eq!(out.args, vec![json!("A"), json!("%g%")]);
        assert_eq!(compile(&Expression::and(vec![])).unwrap().sql, "TRUE");
        assert_eq!(compile(&Expression::or(vec![])).unwrap().sql, "FALSE");
    }

    #[test]
    fn like_per_dialect() {
        let r = resolver();
        let like = Expression::like("dom", "%x%");
        let druid = ExpressionCompiler::new(&DruidDialect, &r).compile(&like).unwrap();
        assert_eq!(druid.sql, "LOWER(\"dom\") LIKE LOWER(?)");
        let ch = ExpressionCompiler::new(&ClickHouseDialect, &r).compile(&like).unwrap();
        assert_eq!(ch.sql, "\"dom\"::TEXT ILIKE ?");

        let not_like = Expression::cond(
            Operator::NotLike,
            vec![Expression::ident("dom"), Expression::value("%x%")],
        );
        assert_eq!(
            compile(&not_like).unwrap().sql,
            "(\"dom\" NOT ILIKE ? OR \"dom\" IS NULL)"
        );
    }

    #[test]
    fn like_requires_two_operands() {
        let bad = Expression::cond(Operator::Like, vec![Expression::ident("dom")]);
        assert!(matches!(compile(&bad), Err(MetricsViewError::Validation(_))));
    }

    #[test]
    fn undeclared_comparison_alias_is_named() {
        let err = compile(&Expression::eq("m__delta_rel", 1)).unwrap_err();
        assert_eq!(err.to_string(), "unknown column filter: m__delta_rel");
        let err = compile(&Expression::eq("nope", 1)).unwrap_err();
        assert!(matches!(err, MetricsViewError::UnknownReference { .. }));
    }
}
