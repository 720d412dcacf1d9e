//! Minimal SELECT model and a renderer that keeps placeholder arguments in
//! the order their `?` markers appear in the SQL text.

use serde_json::Value;

use crate::dialect::Dialect;

/// A SQL snippet with positional `?` placeholders and the values bound to them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub args: Vec<Value>,
}

impl SqlFragment {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// Join fragments with `AND`, parenthesizing each one.
    pub fn and_all(parts: Vec<SqlFragment>) -> Option<SqlFragment> {
        Self::join_all(parts, " AND ")
    }

    pub fn join_all(parts: Vec<SqlFragment>, sep: &str) -> Option<SqlFragment> {
        let parts: Vec<SqlFragment> = parts.into_iter().filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return None;
        }
        if parts.len() == 1 {
            return parts.into_iter().next();
        }
        let mut sql = Vec::with_capacity(parts.len());
        let mut args = Vec::new();
        for part in parts {
            sql.push(format!("({})", part.sql));
            args.extend(part.args);
        }
        Some(SqlFragment {
            sql: sql.join(sep),
            args,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: SqlFragment,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: SqlFragment, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }

    pub fn raw(sql: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::new(SqlFragment::raw(sql), alias)
    }

    pub fn star() -> Self {
        Self {
            expr: SqlFragment::raw("*"),
            alias: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TableSource {
    /// Already escaped table reference.
    Table(String),
    Subquery(Box<SelectQuery>),
}

impl Default for TableSource {
    fn default() -> Self {
        TableSource::Table(String::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TableRef {
    pub source: TableSource,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn table(escaped: impl Into<String>) -> Self {
        Self {
            source: TableSource::Table(escaped.into()),
            alias: None,
        }
    }

    pub fn subquery(query: SelectQuery, alias: impl Into<String>) -> Self {
        Self {
            source: TableSource::Subquery(Box::new(query)),
            alias: Some(alias.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlJoinType {
    Inner,
    Left,
    Full,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub join_type: SqlJoinType,
    pub table: TableRef,
    pub on: SqlFragment,
}

/// Sort key. `expr` is an escaped output alias or ordinal.
#[derive(Debug, Clone)]
pub struct OrderItem {
    pub expr: String,
    pub desc: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub distinct: bool,
    pub select: Vec<SelectItem>,
    pub from: TableRef,
    /// Raw clauses appended after the FROM item, e.g. lateral unnests.
    pub laterals: Vec<String>,
    pub joins: Vec<Join>,
    pub filters: Vec<SqlFragment>,
    /// 1-based ordinals into `select`.
    pub group_by: Vec<usize>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectQuery {
    /// Wrap this query as a derived table: `SELECT * FROM (self) alias`.
    pub fn wrap(self, alias: &str) -> SelectQuery {
        SelectQuery {
            select: vec![SelectItem::star()],
            from: TableRef::subquery(self, alias),
            ..Default::default()
        }
    }
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn render_select(&self, query: &SelectQuery) -> SqlFragment {
        let mut args = Vec::new();

        let select_items: Vec<String> = query
            .select
            .iter()
            .map(|item| {
                args.extend(item.expr.args.iter().cloned());
                match &item.alias {
                    Some(alias) => format!(
                        "{} AS {}",
                        item.expr.sql,
                        self.dialect.escape_identifier(alias)
                    ),
                    None => item.expr.sql.clone(),
                }
            })
            .collect();

        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if query.distinct { "DISTINCT " } else { "" },
            select_items.join(", "),
            self.render_table_ref(&query.from, &mut args)
        );

        for lateral in &query.laterals {
            sql.push_str(lateral);
        }

        for join in &query.joins {
            let join_kw = match join.join_type {
                SqlJoinType::Inner => "JOIN",
                SqlJoinType::Left => "LEFT OUTER JOIN",
                SqlJoinType::Full => "FULL OUTER JOIN",
            };
            let table = self.render_table_ref(&join.table, &mut args);
            args.extend(join.on.args.iter().cloned());
            sql.push_str(&format!(" {join_kw} {table} ON ({})", join.on.sql));
        }

        if let Some(filter) = SqlFragment::and_all(query.filters.clone()) {
            sql.push_str(&format!(" WHERE {}", filter.sql));
            args.extend(filter.args);
        }

        if !query.group_by.is_empty() {
            let groups: Vec<String> = query.group_by.iter().map(|g| g.to_string()).collect();
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| self.dialect.order_by_expression(&o.expr, o.desc))
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        SqlFragment { sql, args }
    }

    fn render_table_ref(&self, table: &TableRef, args: &mut Vec<Value>) -> String {
        let base = match &table.source {
            TableSource::Table(name) => name.clone(),
            TableSource::Subquery(query) => {
                let inner = self.render_select(query);
                args.extend(inner.args);
                format!("({})", inner.sql)
            }
        };
        match &table.alias {
            Some(alias) => format!("{base} AS {}", self.dialect.escape_identifier(alias)),
            None => base,
        }
    }
}
