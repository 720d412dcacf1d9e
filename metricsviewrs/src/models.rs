use serde::{de, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chrono::{DateTime, Utc};

use crate::dialect::DialectKind;
use crate::expression::Expression;
use crate::security::SecurityRule;
use crate::timeutil::TimeGrain;

/// A declarative analytical dataset over one table or model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsViewSpec {
    pub name: String,
    #[serde(default)]
    pub connector: String,
    #[serde(default)]
    pub dialect: DialectKind,
    pub database: Option<String>,
    pub database_schema: Option<String>,
    pub table: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub dimensions: Vec<DimensionSpec>,
    #[serde(default)]
    pub measures: Vec<MeasureSpec>,
    pub time_dimension: Option<String>,
    pub watermark_expression: Option<String>,
    #[serde(default = "default_first")]
    pub first_day_of_week: u32,
    #[serde(default = "default_first")]
    pub first_month_of_year: u32,
    #[serde(default)]
    pub security: Vec<SecurityRule>,
    pub description: Option<String>,
}

fn default_first() -> u32 {
    1
}

impl MetricsViewSpec {
    pub fn dimension(&self, name: &str) -> Option<&DimensionSpec> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn measure(&self, name: &str) -> Option<&MeasureSpec> {
        self.measures.iter().find(|m| m.name == name)
    }

    /// Table or model the view reads from.
    pub fn relation(&self) -> Option<&str> {
        self.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .or_else(|| self.table.as_deref().filter(|t| !t.is_empty()))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DimensionSpec {
    pub name: String,
    pub column: Option<String>,
    pub expression: Option<String>,
    pub label: Option<String>,
    #[serde(default)]
    pub unnest: bool,
}

impl<'de> Deserialize<'de> for DimensionSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(DimensionSpec {
                name: s.clone(),
                column: Some(s),
                ..Default::default()
            }),
            other => {
                #[derive(Deserialize)]
                struct Full {
                    name: String,
                    column: Option<String>,
                    expression: Option<String>,
                    label: Option<String>,
                    #[serde(default)]
                    unnest: bool,
                }
                let full = Full::deserialize(other).map_err(de::Error::custom)?;
                Ok(DimensionSpec {
                    name: full.name,
                    column: full.column,
                    expression: full.expression,
                    label: full.label,
                    unnest: full.unnest,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasureSpec {
    pub name: String,
    pub expression: Option<String>,
    pub builtin: Option<BuiltinMeasure>,
    pub label: Option<String>,
}

/// Measures synthesized without a declared SQL expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuiltinMeasure {
    Count,
    CountDistinct { dimension: String },
}

// === Query parameters ===

/// Half-open range `[start, end)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_zone: String,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            time_zone: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionRequest {
    pub name: String,
    #[serde(default)]
    pub time_grain: TimeGrain,
    #[serde(default)]
    pub time_zone: String,
    pub alias: Option<String>,
}

impl DimensionRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_grain(name: impl Into<String>, grain: TimeGrain) -> Self {
        Self {
            name: name.into(),
            time_grain: grain,
            ..Default::default()
        }
    }

    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasureRequest {
    pub name: String,
    pub builtin: Option<BuiltinMeasure>,
    pub filter: Option<Expression>,
}

impl MeasureRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortType {
    #[default]
    Base,
    Comparison,
    AbsDelta,
    RelDelta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub name: String,
    #[serde(default)]
    pub desc: bool,
    #[serde(default)]
    pub sort_type: SortType,
}

impl Sort {
    pub fn asc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_view_yaml() {
        let yaml = r#"
name: ad_bids
table: ad_bids
time_dimension: timestamp
first_month_of_year: 4
dimensions:
  - publisher
  - name: domain
    expression: lower(domain)
measures:
  - name: total
    builtin:
      kind: count
  - name: bid_price
    expression: avg(bid_price)
"#;
        let view: MetricsViewSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(view.dialect, DialectKind::DuckDb);
        assert_eq!(view.first_day_of_week, 1);
        assert_eq!(view.first_month_of_year, 4);
        assert_eq!(view.dimensions[0].column.as_deref(), Some("publisher"));
        assert_eq!(view.dimension("domain").unwrap().expression.as_deref(), Some("lower(domain)"));
        assert_eq!(view.measure("total").unwrap().builtin, Some(BuiltinMeasure::Count));
        assert_eq!(view.relation(), Some("ad_bids"));
    }

    #[test]
    fn sort_type_defaults_to_base() {
        let sort: Sort = serde_json::from_str(r#"{"name": "m", "desc": true}"#).unwrap();
        assert_eq!(sort.sort_type, SortType::Base);
        let sort: Sort = serde_json::from_str(r#"{"name": "m", "sort_type": "rel_delta"}"#).unwrap();
        assert_eq!(sort.sort_type, SortType::RelDelta);
    }
}
