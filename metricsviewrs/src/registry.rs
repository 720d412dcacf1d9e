use std::collections::HashMap;
use std::fs;
use std::path::Path;

use glob::glob;

use crate::error::{MetricsViewError, Result};
use crate::models::MetricsViewSpec;
use crate::timeutil;

/// Metrics-view definitions keyed by name.
#[derive(Debug, Default, Clone)]
pub struct MetricsViewRegistry {
    pub views: HashMap<String, MetricsViewSpec>,
}

impl MetricsViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_views(views: Vec<MetricsViewSpec>) -> Result<Self> {
        let mut registry = MetricsViewRegistry::new();
        for view in views {
            registry.insert(view)?;
        }
        Ok(registry)
    }

    /// Load every `*.yml` and `*.yaml` file in `root`.
    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let dir = root.as_ref();
        if !dir.exists() {
            return Err(MetricsViewError::Validation(format!(
                "metrics views directory not found: {}",
                dir.display()
            )));
        }
        let mut registry = MetricsViewRegistry::new();
        for pattern in ["*.yml", "*.yaml"] {
            for entry in glob(&format!("{}/{pattern}", dir.display()))
                .map_err(|e| MetricsViewError::Other(e.into()))?
                .flatten()
            {
                registry.load_view_file(&entry)?;
            }
        }
        tracing::info!(path = %dir.display(), views = registry.views.len(), "loaded metrics views");
        Ok(registry)
    }

    fn load_view_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)?;
        let view: MetricsViewSpec = serde_yaml::from_str(&contents)?;
        self.insert(view)
            .map_err(|e| MetricsViewError::Validation(format!("{}: {e}", path.display())))
    }

    /// Validate and add a view. Names must be unique.
    pub fn insert(&mut self, mut view: MetricsViewSpec) -> Result<()> {
        validate(&mut view)?;
        if self.views.contains_key(&view.name) {
            return Err(MetricsViewError::Validation(format!(
                "duplicate metrics view '{}'",
                view.name
            )));
        }
        self.views.insert(view.name.clone(), view);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MetricsViewSpec> {
        self.views.get(name)
    }
}

fn validate(view: &mut MetricsViewSpec) -> Result<()> {
    if view.name.trim().is_empty() {
        return Err(MetricsViewError::Validation("metrics view name is empty".to_string()));
    }
    if view.relation().is_none() {
        return Err(MetricsViewError::Validation(format!(
            "metrics view '{}' has no table or model",
            view.name
        )));
    }
    for measure in &view.measures {
        let has_expression = measure.expression.as_deref().is_some_and(|e| !e.trim().is_empty());
        if !has_expression && measure.builtin.is_none() {
            return Err(MetricsViewError::Validation(format!(
                "measure '{}' of metrics view '{}' has neither an expression nor a builtin kind",
                measure.name, view.name
            )));
        }
    }
    let mut seen = std::collections::HashSet::new();
    for name in view
        .dimensions
        .iter()
        .map(|d| d.name.as_str())
        .chain(view.measures.iter().map(|m| m.name.as_str()))
    {
        if !seen.insert(name) {
            return Err(MetricsViewError::Validation(format!(
                "field '{name}' is defined more than once in metrics view '{}'",
                view.name
            )));
        }
    }
    view.first_day_of_week = timeutil::clamp_first_day_of_week(view.first_day_of_week);
    view.first_month_of_year = timeutil::clamp_first_month_of_year(view.first_month_of_year);
    Ok(())
}
