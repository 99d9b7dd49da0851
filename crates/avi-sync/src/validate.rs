//! Rule engine that decides whether a normalized table may be persisted.
//!
//! Each rule yields one [`CheckResult`]. A table is accepted unless some
//! rule fails with `blocking` set; warnings and non-blocking failures travel
//! with the report as advisory findings.

use std::collections::{BTreeSet, HashSet};

use avi_core::{CheckResult, CheckStatus, NormalizedTable, TableSchema, ValidationReport};
use serde_json::json;

use crate::config::{BoundSpec, CategorySpec, ValidationSettings};

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> String;
    fn evaluate(&self, table: &NormalizedTable) -> CheckResult;
}

#[derive(Default)]
pub struct RuleSet {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Schema, coverage, duplicate and null-ratio rules, then one rule per
    /// configured bound and category list.
    pub fn for_source(schema: &TableSchema, settings: &ValidationSettings) -> Self {
        let mut set = Self::new()
            .with_rule(SchemaRule::new(schema.clone()))
            .with_rule(DateCoverageRule::new(settings.min_coverage, settings.warn_coverage))
            .with_rule(DuplicateKeyRule::new(settings.duplicate_sample_size));
        for bound in &settings.bounds {
            set = set.with_rule(RangeRule::new(bound.clone()));
        }
        for category in &settings.categories {
            set = set.with_rule(CategoryRule::new(category.clone()));
        }
        set.with_rule(NullRatioRule::new(
            settings.max_null_ratio,
            settings.null_ratio_blocking,
        ))
    }

    pub fn names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn validate(&self, table: &NormalizedTable) -> ValidationReport {
        ValidationReport::from_results(self.rules.iter().map(|r| r.evaluate(table)).collect())
    }
}

fn percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// Column set, cell types and non-null constraints against the canonical schema.
pub struct SchemaRule {
    expected: TableSchema,
}

impl SchemaRule {
    pub fn new(expected: TableSchema) -> Self {
        Self { expected }
    }
}

impl ValidationRule for SchemaRule {
    fn name(&self) -> String {
        "schema".to_string()
    }

    fn evaluate(&self, table: &NormalizedTable) -> CheckResult {
        let name = self.name();
        // a column the normalizer had to fill with nulls is as missing as
        // one dropped from the schema
        let mut missing = self
            .expected
            .columns
            .iter()
            .filter(|c| table.schema.column(&c.name).is_none() || table.missing_columns.contains(&c.name))
            .map(|c| c.name.clone())
            .collect::<Vec<_>>();
        for column in &table.missing_columns {
            if !missing.contains(column) {
                missing.push(column.clone());
            }
        }
        let retyped = self
            .expected
            .columns
            .iter()
            .filter_map(|c| {
                let actual = table.schema.column(&c.name)?;
                (actual.column_type != c.column_type).then(|| c.name.clone())
            })
            .collect::<Vec<_>>();
        if !missing.is_empty() || !retyped.is_empty() {
            return CheckResult::new(
                name,
                CheckStatus::Fail,
                true,
                format!("missing columns {missing:?}, retyped columns {retyped:?}"),
            )
            .with_value(json!({ "missing": missing, "retyped": retyped }));
        }

        let width = table.schema.columns.len();
        let mut bad_cells = 0usize;
        let mut first_problem: Option<String> = None;
        for (row_idx, row) in table.rows.iter().enumerate() {
            if row.len() != width {
                bad_cells += 1;
                first_problem.get_or_insert_with(|| {
                    format!("row {row_idx} has {} cells, expected {width}", row.len())
                });
                continue;
            }
            for (cell, spec) in row.iter().zip(&table.schema.columns) {
                let ok = cell.conforms_to(spec.column_type) && (spec.nullable || !cell.is_null());
                if !ok {
                    bad_cells += 1;
                    first_problem.get_or_insert_with(|| {
                        format!("row {row_idx} column `{}` holds {cell}", spec.name)
                    });
                }
            }
        }
        if let Some(problem) = first_problem {
            return CheckResult::new(
                name,
                CheckStatus::Fail,
                true,
                format!("{bad_cells} non-conforming cells; first: {problem}"),
            )
            .with_value(json!(bad_cells));
        }

        let mut extra = table
            .schema
            .columns
            .iter()
            .filter(|c| self.expected.column(&c.name).is_none())
            .map(|c| c.name.clone())
            .collect::<Vec<_>>();
        extra.extend(table.extra_columns.iter().cloned());
        if !extra.is_empty() {
            return CheckResult::new(
                name,
                CheckStatus::Warn,
                true,
                format!("unexpected extra columns {extra:?}"),
            )
            .with_value(json!({ "extra": extra }));
        }
        CheckResult::new(name, CheckStatus::Pass, true, "columns and types match")
    }
}

/// Share of requested calendar days present in the table's date column.
pub struct DateCoverageRule {
    min_coverage: f64,
    warn_coverage: f64,
}

impl DateCoverageRule {
    pub fn new(min_coverage: f64, warn_coverage: f64) -> Self {
        Self {
            min_coverage,
            warn_coverage: warn_coverage.max(min_coverage),
        }
    }

    pub fn coverage(table: &NormalizedTable) -> f64 {
        let expected = table.requested_range.days();
        if expected == 0 {
            return 0.0;
        }
        let present = table
            .column_values(&table.schema.date_column)
            .map(|cells| {
                cells
                    .filter_map(|c| c.as_date())
                    .filter(|d| table.requested_range.contains(*d))
                    .collect::<BTreeSet<_>>()
                    .len()
            })
            .unwrap_or(0);
        present as f64 / expected as f64
    }
}

impl ValidationRule for DateCoverageRule {
    fn name(&self) -> String {
        "date_coverage".to_string()
    }

    fn evaluate(&self, table: &NormalizedTable) -> CheckResult {
        let expected = format!(">= {}", percent(self.min_coverage));
        if table.is_empty() {
            return CheckResult::new(self.name(), CheckStatus::Fail, true, "table has no rows")
                .with_value(json!(0.0))
                .with_expected(expected);
        }
        let ratio = Self::coverage(table);
        let status = if ratio < self.min_coverage {
            CheckStatus::Fail
        } else if ratio < self.warn_coverage {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
        CheckResult::new(
            self.name(),
            status,
            true,
            format!(
                "{} of {} requested days present ({})",
                percent(ratio),
                table.requested_range.days(),
                table.requested_range
            ),
        )
        .with_value(json!(ratio))
        .with_expected(expected)
    }
}

/// Primary-key uniqueness. Duplicates are reported, never removed.
pub struct DuplicateKeyRule {
    sample_size: usize,
}

impl DuplicateKeyRule {
    pub fn new(sample_size: usize) -> Self {
        Self { sample_size }
    }
}

impl ValidationRule for DuplicateKeyRule {
    fn name(&self) -> String {
        "duplicate_keys".to_string()
    }

    fn evaluate(&self, table: &NormalizedTable) -> CheckResult {
        let Some(key_indices) = table.schema.key_indices() else {
            return CheckResult::new(
                self.name(),
                CheckStatus::Fail,
                true,
                format!("primary key {:?} not present in schema", table.schema.primary_key),
            );
        };

        let mut seen: HashSet<Vec<String>> = HashSet::with_capacity(table.row_count());
        let mut sampled: HashSet<Vec<String>> = HashSet::new();
        let mut duplicates = 0usize;
        let mut sample: Vec<String> = Vec::new();
        for row in &table.rows {
            let key = key_indices
                .iter()
                .map(|&i| row.get(i).map(ToString::to_string).unwrap_or_default())
                .collect::<Vec<_>>();
            if !seen.contains(&key) {
                seen.insert(key);
                continue;
            }
            duplicates += 1;
            if sample.len() < self.sample_size && !sampled.contains(&key) {
                sample.push(key.join("|"));
                sampled.insert(key);
            }
        }

        let value = json!({ "count": duplicates, "sample": sample });
        let expected = format!("unique ({})", table.schema.primary_key.join(", "));
        if duplicates == 0 {
            CheckResult::new(self.name(), CheckStatus::Pass, true, "no duplicate keys")
                .with_value(value)
                .with_expected(expected)
        } else {
            CheckResult::new(
                self.name(),
                CheckStatus::Fail,
                true,
                format!("{duplicates} duplicate key rows, e.g. {}", sample.join("; ")),
            )
            .with_value(value)
            .with_expected(expected)
        }
    }
}

/// Numeric sanity bound on one column; nulls are not counted.
pub struct RangeRule {
    spec: BoundSpec,
}

impl RangeRule {
    pub fn new(spec: BoundSpec) -> Self {
        Self { spec }
    }

    fn out_of_bounds(&self, value: f64) -> bool {
        self.spec.min.is_some_and(|min| value < min) || self.spec.max.is_some_and(|max| value > max)
    }

    fn describe_bounds(&self) -> String {
        let lower = self.spec.min.map_or_else(|| "-inf".to_string(), |v| v.to_string());
        let upper = self.spec.max.map_or_else(|| "inf".to_string(), |v| v.to_string());
        format!("[{lower}, {upper}]")
    }
}

impl ValidationRule for RangeRule {
    fn name(&self) -> String {
        format!("range:{}", self.spec.column)
    }

    fn evaluate(&self, table: &NormalizedTable) -> CheckResult {
        let expected = self.describe_bounds();
        let Some(values) = table.column_values(&self.spec.column) else {
            return CheckResult::new(
                self.name(),
                CheckStatus::Warn,
                false,
                format!("column `{}` not present", self.spec.column),
            );
        };

        let mut checked = 0usize;
        let mut violations = 0usize;
        for value in values.filter_map(|c| c.as_f64()) {
            checked += 1;
            if self.out_of_bounds(value) {
                violations += 1;
            }
        }
        let ratio = if checked == 0 {
            0.0
        } else {
            violations as f64 / checked as f64
        };
        let value = json!({ "violations": violations, "checked": checked, "ratio": ratio });

        let over_count = violations > self.spec.max_violations;
        let over_ratio = self
            .spec
            .max_violation_ratio
            .is_some_and(|limit| ratio > limit);
        let (status, detail) = if violations == 0 {
            (CheckStatus::Pass, format!("{checked} values within bounds"))
        } else if over_count || over_ratio {
            (
                CheckStatus::Fail,
                format!("{violations} of {checked} values out of bounds"),
            )
        } else {
            (
                CheckStatus::Warn,
                format!("{violations} of {checked} values out of bounds, within tolerance"),
            )
        };
        CheckResult::new(self.name(), status, true, detail)
            .with_value(value)
            .with_expected(expected)
    }
}

/// Allowed-value check for a categorical column.
pub struct CategoryRule {
    spec: CategorySpec,
    allowed: BTreeSet<String>,
}

impl CategoryRule {
    pub fn new(spec: CategorySpec) -> Self {
        let allowed = spec.allowed.iter().map(|v| v.to_ascii_uppercase()).collect();
        Self { spec, allowed }
    }
}

impl ValidationRule for CategoryRule {
    fn name(&self) -> String {
        format!("category:{}", self.spec.column)
    }

    fn evaluate(&self, table: &NormalizedTable) -> CheckResult {
        let expected = format!("one of {:?}", self.spec.allowed);
        let Some(values) = table.column_values(&self.spec.column) else {
            return CheckResult::new(
                self.name(),
                CheckStatus::Warn,
                false,
                format!("column `{}` not present", self.spec.column),
            );
        };

        let mut unknown = BTreeSet::new();
        let mut violations = 0usize;
        for text in values.filter_map(|c| c.as_text()) {
            if !self.allowed.contains(&text.to_ascii_uppercase()) {
                violations += 1;
                unknown.insert(text.to_string());
            }
        }

        let value = json!({ "violations": violations, "unknown": unknown });
        let result = if violations == 0 {
            CheckResult::new(self.name(), CheckStatus::Pass, self.spec.blocking, "all values allowed")
        } else {
            let status = if self.spec.blocking {
                CheckStatus::Fail
            } else {
                CheckStatus::Warn
            };
            CheckResult::new(
                self.name(),
                status,
                self.spec.blocking,
                format!("{violations} values outside the allowed set: {unknown:?}"),
            )
        };
        result.with_value(value).with_expected(expected)
    }
}

/// Overall share of null cells across the table.
pub struct NullRatioRule {
    max_null_ratio: f64,
    blocking: bool,
}

impl NullRatioRule {
    pub fn new(max_null_ratio: f64, blocking: bool) -> Self {
        Self {
            max_null_ratio,
            blocking,
        }
    }
}

impl ValidationRule for NullRatioRule {
    fn name(&self) -> String {
        "null_ratio".to_string()
    }

    fn evaluate(&self, table: &NormalizedTable) -> CheckResult {
        let total = table.rows.iter().map(Vec::len).sum::<usize>();
        let nulls = table
            .rows
            .iter()
            .flatten()
            .filter(|c| c.is_null())
            .count();
        let ratio = if total == 0 {
            0.0
        } else {
            nulls as f64 / total as f64
        };
        let status = if nulls == 0 {
            CheckStatus::Pass
        } else if ratio <= self.max_null_ratio {
            CheckStatus::Warn
        } else {
            CheckStatus::Fail
        };
        CheckResult::new(
            self.name(),
            status,
            self.blocking,
            format!("{nulls} of {total} cells null ({})", percent(ratio)),
        )
        .with_value(json!(ratio))
        .with_expected(format!("<= {}", percent(self.max_null_ratio)))
    }
}
