/// Validation Engine - Track-Agnostic Rule Evaluation
///
/// **Core Responsibility:**
/// Evaluate a challenge's declarative rules against what a run left behind
/// and produce exactly one `ValidationOutcome` per rule, in rule order.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about Redis
/// - Pure functions: (rules, context) → outcomes; the context is never mutated
/// - A bad rule (unknown type, bad parameters, wrong track) fails on its own
///   and never aborts the batch
///
/// **Where rules are decided:**
/// - Web rules are run by the harness inside the container and matched here by name
/// - `custom_check` expressions are evaluated inside the data container and matched by name
/// - `aws_resource_exists` probes are run by the cloud runner and matched by name
/// - Everything else is decided here from the captured snapshot

use crate::protocol::{CheckReport, VariableSnapshot, WebTestReport};
use gradebox_common::types::{CommandRecord, ValidationOutcome, ValidationRule};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Relative tolerance of `value_check` when none is given (0.1%)
pub const DEFAULT_RELATIVE_TOLERANCE: f64 = 1e-3;

pub use gradebox_common::types::RULE_TYPES;

fn default_frame() -> String {
    "df".to_string()
}

/// Emulator resource kinds that can be probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwsResourceKind {
    #[serde(alias = "s3")]
    S3Bucket,
    #[serde(alias = "dynamodb")]
    DynamodbTable,
    #[serde(alias = "sqs")]
    SqsQueue,
    #[serde(alias = "lambda")]
    LambdaFunction,
    #[serde(alias = "iam")]
    IamRole,
}

/// Typed form of a [`ValidationRule`]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    VariableExists {
        variable: String,
    },
    ValueCheck {
        variable: String,
        expected: Value,
        #[serde(default)]
        tolerance: Option<f64>,
    },
    DataframeShape {
        #[serde(default = "default_frame")]
        variable: String,
        #[serde(default)]
        rows: Option<u64>,
        #[serde(default)]
        columns: Option<u64>,
    },
    RowCount {
        #[serde(default = "default_frame")]
        variable: String,
        #[serde(default)]
        expected: Option<u64>,
        #[serde(default)]
        min: Option<u64>,
        #[serde(default)]
        max: Option<u64>,
    },
    ColumnExists {
        #[serde(default = "default_frame")]
        variable: String,
        column: String,
    },
    ValueInResult {
        variable: String,
        expected: Value,
    },
    CustomCheck {
        check: String,
    },
    OutputContains {
        pattern: String,
    },
    ResourceExists {
        resource_type: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        count: Option<usize>,
    },
    AwsResourceExists {
        #[serde(alias = "resource")]
        service: AwsResourceKind,
        name: String,
    },
    ImageExists,
    ContainerRunning,
    PortAccessible {
        port: u16,
    },
}

impl Check {
    /// Parse a stored rule. The error is the message of the failed outcome.
    pub fn parse(rule: &ValidationRule) -> Result<Check, String> {
        if !RULE_TYPES.contains(&rule.rule_type.as_str()) {
            return Err(format!("Unknown rule type '{}'", rule.rule_type));
        }

        let mut document = rule.params.clone();
        document.insert("type".to_string(), Value::String(rule.rule_type.clone()));

        let check: Check = serde_json::from_value(Value::Object(document))
            .map_err(|e| format!("Invalid parameters for '{}': {}", rule.rule_type, e))?;

        match &check {
            Check::DataframeShape {
                rows: None,
                columns: None,
                ..
            } => Err("dataframe_shape needs 'rows' or 'columns'".to_string()),
            Check::RowCount {
                expected: None,
                min: None,
                max: None,
                ..
            } => Err("row_count needs 'expected', 'min' or 'max'".to_string()),
            Check::ValueCheck {
                tolerance: Some(t), ..
            } if *t < 0.0 || !t.is_finite() => {
                Err(format!("tolerance must be a non-negative number, got {}", t))
            }
            _ => Ok(check),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebContext {
    pub tests: Vec<WebTestReport>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataContext {
    pub variables: BTreeMap<String, VariableSnapshot>,
    pub checks: BTreeMap<String, CheckReport>,
    pub output: String,
}

/// One resource from `terraform show -json`
#[derive(Debug, Clone, PartialEq)]
pub struct StateResource {
    pub address: String,
    pub resource_type: String,
    pub name: String,
    pub values: Value,
}

impl StateResource {
    /// Identifying attribute values a rule's `name` may refer to
    fn identifiers(&self) -> impl Iterator<Item = &str> + '_ {
        const KEYS: &[&str] = &["bucket", "name", "function_name", "table_name", "queue_name"];
        KEYS.iter()
            .filter_map(move |k| self.values.get(*k).and_then(Value::as_str))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub exists: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerraformContext {
    pub resources: Vec<StateResource>,
    /// Keyed by rule name
    pub probes: BTreeMap<String, ProbeResult>,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliContext {
    pub commands: Vec<CommandRecord>,
    /// Keyed by rule name
    pub probes: BTreeMap<String, ProbeResult>,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DockerContext {
    pub image_built: bool,
    pub image_tag: String,
    /// `None` when the image was never started
    pub container_running: Option<bool>,
    pub open_ports: BTreeMap<u16, bool>,
}

/// Everything a run exposes to rule evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionContext {
    Web(WebContext),
    Data(DataContext),
    Terraform(TerraformContext),
    CliCommands(CliContext),
    Docker(DockerContext),
}

impl ExecutionContext {
    fn label(&self) -> &'static str {
        match self {
            ExecutionContext::Web(_) => "web",
            ExecutionContext::Data(_) => "data",
            ExecutionContext::Terraform(_) => "terraform",
            ExecutionContext::CliCommands(_) => "cli",
            ExecutionContext::Docker(_) => "docker",
        }
    }

    fn output(&self) -> Option<&str> {
        match self {
            ExecutionContext::Data(d) => Some(&d.output),
            ExecutionContext::Terraform(t) => Some(&t.output),
            ExecutionContext::CliCommands(c) => Some(&c.output),
            ExecutionContext::Web(_) | ExecutionContext::Docker(_) => None,
        }
    }

    fn probes(&self) -> Option<&BTreeMap<String, ProbeResult>> {
        match self {
            ExecutionContext::Terraform(t) => Some(&t.probes),
            ExecutionContext::CliCommands(c) => Some(&c.probes),
            _ => None,
        }
    }
}

/// Evaluate every rule in order
pub fn evaluate(rules: &[ValidationRule], context: &ExecutionContext) -> Vec<ValidationOutcome> {
    rules.iter().map(|rule| evaluate_rule(rule, context)).collect()
}

pub fn evaluate_rule(rule: &ValidationRule, context: &ExecutionContext) -> ValidationOutcome {
    let name = rule.name.as_str();

    // The harness owns the web rule vocabulary
    if let ExecutionContext::Web(web) = context {
        return harness_outcome(name, web);
    }

    let check = match Check::parse(rule) {
        Ok(check) => check,
        Err(message) => return ValidationOutcome::fail(name, message),
    };

    match (&check, context) {
        (Check::VariableExists { variable }, ExecutionContext::Data(data)) => {
            variable_exists(name, variable, data)
        }
        (
            Check::ValueCheck {
                variable,
                expected,
                tolerance,
            },
            ExecutionContext::Data(data),
        ) => value_check(name, variable, expected, *tolerance, data),
        (
            Check::DataframeShape {
                variable,
                rows,
                columns,
            },
            ExecutionContext::Data(data),
        ) => dataframe_shape(name, variable, *rows, *columns, data),
        (
            Check::RowCount {
                variable,
                expected,
                min,
                max,
            },
            ExecutionContext::Data(data),
        ) => row_count(name, variable, *expected, *min, *max, data),
        (Check::ColumnExists { variable, column }, ExecutionContext::Data(data)) => {
            column_exists(name, variable, column, data)
        }
        (Check::ValueInResult { variable, expected }, ExecutionContext::Data(data)) => {
            value_in_result(name, variable, expected, data)
        }
        (Check::CustomCheck { .. }, ExecutionContext::Data(data)) => {
            reported_check(name, data.checks.get(name))
        }
        (Check::OutputContains { pattern }, ctx) if ctx.output().is_some() => {
            output_contains(name, pattern, ctx.output().unwrap_or_default())
        }
        (
            Check::ResourceExists {
                resource_type,
                name: resource_name,
                count,
            },
            ExecutionContext::Terraform(tf),
        ) => resource_exists(name, resource_type, resource_name.as_deref(), *count, tf),
        (Check::AwsResourceExists { service, name: resource }, ctx) if ctx.probes().is_some() => {
            probe_outcome(name, *service, resource, ctx.probes().and_then(|p| p.get(name)))
        }
        (Check::ImageExists, ExecutionContext::Docker(docker)) => image_exists(name, docker),
        (Check::ContainerRunning, ExecutionContext::Docker(docker)) => {
            container_running(name, docker)
        }
        (Check::PortAccessible { port }, ExecutionContext::Docker(docker)) => {
            port_accessible(name, *port, docker)
        }
        _ => ValidationOutcome::fail(
            name,
            format!(
                "Rule type '{}' does not apply to {} submissions",
                rule.rule_type,
                context.label()
            ),
        ),
    }
}

fn harness_outcome(name: &str, web: &WebContext) -> ValidationOutcome {
    match web.tests.iter().find(|t| t.name == name) {
        Some(test) => ValidationOutcome {
            name: name.to_string(),
            passed: test.passed,
            message: if test.message.is_empty() {
                if test.passed { "Passed" } else { "Failed" }.to_string()
            } else {
                test.message.clone()
            },
        },
        None => ValidationOutcome::fail(name, "Test harness reported no result for this rule"),
    }
}

fn reported_check(name: &str, report: Option<&CheckReport>) -> ValidationOutcome {
    match report {
        Some(report) => ValidationOutcome {
            name: name.to_string(),
            passed: report.passed,
            message: report.message.clone(),
        },
        None => ValidationOutcome::fail(name, "Check was not evaluated"),
    }
}

fn lookup<'a>(
    name: &str,
    variable: &str,
    data: &'a DataContext,
) -> Result<&'a VariableSnapshot, ValidationOutcome> {
    data.variables
        .get(variable)
        .ok_or_else(|| ValidationOutcome::fail(name, format!("Variable '{}' not found", variable)))
}

fn variable_exists(name: &str, variable: &str, data: &DataContext) -> ValidationOutcome {
    match lookup(name, variable, data) {
        Ok(snapshot) => ValidationOutcome::pass(
            name,
            format!("Variable '{}' exists ({})", variable, snapshot.type_name),
        ),
        Err(outcome) => outcome,
    }
}

/// Absolute tolerance when given, relative otherwise
fn numbers_match(actual: f64, expected: f64, tolerance: Option<f64>) -> bool {
    let allowed = match tolerance {
        Some(absolute) => absolute,
        None => DEFAULT_RELATIVE_TOLERANCE * expected.abs(),
    };
    (actual - expected).abs() <= allowed
}

fn values_match(actual: &Value, expected: &Value, tolerance: Option<f64>) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(e)) => numbers_match(a, e, tolerance),
        _ => actual == expected,
    }
}

fn value_check(
    name: &str,
    variable: &str,
    expected: &Value,
    tolerance: Option<f64>,
    data: &DataContext,
) -> ValidationOutcome {
    let snapshot = match lookup(name, variable, data) {
        Ok(s) => s,
        Err(outcome) => return outcome,
    };
    let Some(actual) = &snapshot.value else {
        return ValidationOutcome::fail(
            name,
            format!("Value of '{}' ({}) could not be captured", variable, snapshot.type_name),
        );
    };

    let bound = match (tolerance, expected.as_f64()) {
        (Some(t), Some(_)) => format!(" ± {}", t),
        (None, Some(_)) => " (±0.1%)".to_string(),
        _ => String::new(),
    };

    if values_match(actual, expected, tolerance) {
        ValidationOutcome::pass(name, format!("{} = {}", variable, actual))
    } else {
        ValidationOutcome::fail(
            name,
            format!("{} = {}, expected {}{}", variable, actual, expected, bound),
        )
    }
}

fn dataframe_shape(
    name: &str,
    variable: &str,
    rows: Option<u64>,
    columns: Option<u64>,
    data: &DataContext,
) -> ValidationOutcome {
    let snapshot = match lookup(name, variable, data) {
        Ok(s) => s,
        Err(outcome) => return outcome,
    };
    let Some(shape) = &snapshot.shape else {
        return ValidationOutcome::fail(
            name,
            format!("'{}' is a {}, not a table", variable, snapshot.type_name),
        );
    };

    let actual_rows = shape.first().copied();
    let actual_cols = shape.get(1).copied();
    let rows_ok = rows.map_or(true, |r| actual_rows == Some(r));
    let cols_ok = columns.map_or(true, |c| actual_cols == Some(c));

    let shown = format!("{:?}", shape);
    if rows_ok && cols_ok {
        ValidationOutcome::pass(name, format!("'{}' has shape {}", variable, shown))
    } else {
        let wanted = format!(
            "({}, {})",
            rows.map_or("*".to_string(), |r| r.to_string()),
            columns.map_or("*".to_string(), |c| c.to_string())
        );
        ValidationOutcome::fail(
            name,
            format!("'{}' has shape {}, expected {}", variable, shown, wanted),
        )
    }
}

fn row_count(
    name: &str,
    variable: &str,
    expected: Option<u64>,
    min: Option<u64>,
    max: Option<u64>,
    data: &DataContext,
) -> ValidationOutcome {
    let snapshot = match lookup(name, variable, data) {
        Ok(s) => s,
        Err(outcome) => return outcome,
    };
    let Some(rows) = snapshot.rows() else {
        return ValidationOutcome::fail(name, format!("'{}' has no row count", variable));
    };

    let ok = expected.map_or(true, |e| rows == e)
        && min.map_or(true, |m| rows >= m)
        && max.map_or(true, |m| rows <= m);

    if ok {
        ValidationOutcome::pass(name, format!("'{}' has {} rows", variable, rows))
    } else {
        let mut wanted = Vec::new();
        if let Some(e) = expected {
            wanted.push(format!("exactly {}", e));
        }
        if let Some(m) = min {
            wanted.push(format!("at least {}", m));
        }
        if let Some(m) = max {
            wanted.push(format!("at most {}", m));
        }
        ValidationOutcome::fail(
            name,
            format!("'{}' has {} rows, expected {}", variable, rows, wanted.join(" and ")),
        )
    }
}

fn column_exists(name: &str, variable: &str, column: &str, data: &DataContext) -> ValidationOutcome {
    let snapshot = match lookup(name, variable, data) {
        Ok(s) => s,
        Err(outcome) => return outcome,
    };
    match &snapshot.columns {
        Some(columns) if columns.iter().any(|c| c == column) => {
            ValidationOutcome::pass(name, format!("Column '{}' exists in '{}'", column, variable))
        }
        Some(_) => {
            ValidationOutcome::fail(name, format!("Column '{}' not found in '{}'", column, variable))
        }
        None => ValidationOutcome::fail(name, format!("'{}' has no columns", variable)),
    }
}

fn value_in_result(name: &str, variable: &str, expected: &Value, data: &DataContext) -> ValidationOutcome {
    let snapshot = match lookup(name, variable, data) {
        Ok(s) => s,
        Err(outcome) => return outcome,
    };
    let Some(actual) = &snapshot.value else {
        return ValidationOutcome::fail(
            name,
            format!("Value of '{}' ({}) could not be captured", variable, snapshot.type_name),
        );
    };

    let found = match actual {
        Value::Array(items) => items.iter().any(|item| values_match(item, expected, None)),
        Value::Object(map) => {
            expected.as_str().map_or(false, |key| map.contains_key(key))
                || map.values().any(|v| values_match(v, expected, None))
        }
        Value::String(text) => match expected {
            Value::String(needle) => text.contains(needle.as_str()),
            other => text.contains(&other.to_string()),
        },
        scalar => values_match(scalar, expected, None),
    };

    if found {
        ValidationOutcome::pass(name, format!("{} found in '{}'", expected, variable))
    } else {
        ValidationOutcome::fail(name, format!("{} not found in '{}'", expected, variable))
    }
}

fn output_contains(name: &str, pattern: &str, output: &str) -> ValidationOutcome {
    if output.contains(pattern) {
        ValidationOutcome::pass(name, format!("Output contains '{}'", pattern))
    } else {
        ValidationOutcome::fail(name, format!("Output does not contain '{}'", pattern))
    }
}

fn resource_exists(
    name: &str,
    resource_type: &str,
    resource_name: Option<&str>,
    count: Option<usize>,
    tf: &TerraformContext,
) -> ValidationOutcome {
    let matching: Vec<&StateResource> = tf
        .resources
        .iter()
        .filter(|r| r.resource_type == resource_type)
        .filter(|r| {
            resource_name.map_or(true, |wanted| {
                r.name == wanted || r.identifiers().any(|id| id == wanted)
            })
        })
        .collect();

    let wanted = count.unwrap_or(1);
    let label = match resource_name {
        Some(n) => format!("{} '{}'", resource_type, n),
        None => resource_type.to_string(),
    };

    if matching.len() >= wanted {
        let addresses: Vec<&str> = matching.iter().map(|r| r.address.as_str()).collect();
        ValidationOutcome::pass(name, format!("Found {}: {}", label, addresses.join(", ")))
    } else {
        ValidationOutcome::fail(
            name,
            format!("Expected {} x {} in state, found {}", wanted, label, matching.len()),
        )
    }
}

fn probe_outcome(
    name: &str,
    kind: AwsResourceKind,
    resource: &str,
    probe: Option<&ProbeResult>,
) -> ValidationOutcome {
    match probe {
        Some(p) if p.exists => {
            ValidationOutcome::pass(name, format!("{:?} '{}' exists in the emulator", kind, resource))
        }
        Some(p) => ValidationOutcome::fail(
            name,
            format!("{:?} '{}' not found in the emulator: {}", kind, resource, p.detail),
        ),
        None => ValidationOutcome::fail(name, format!("{:?} '{}' was not probed", kind, resource)),
    }
}

fn image_exists(name: &str, docker: &DockerContext) -> ValidationOutcome {
    if docker.image_built {
        ValidationOutcome::pass(name, "Image built successfully")
    } else {
        ValidationOutcome::fail(name, "Image was not built")
    }
}

fn container_running(name: &str, docker: &DockerContext) -> ValidationOutcome {
    match docker.container_running {
        Some(true) => ValidationOutcome::pass(name, "Container is running"),
        Some(false) => ValidationOutcome::fail(name, "Container exited after start"),
        None => ValidationOutcome::fail(name, "Container was not started"),
    }
}

fn port_accessible(name: &str, port: u16, docker: &DockerContext) -> ValidationOutcome {
    match docker.open_ports.get(&port) {
        Some(true) => ValidationOutcome::pass(name, format!("Port {} is accepting connections", port)),
        Some(false) => ValidationOutcome::fail(name, format!("Port {} is not accepting connections", port)),
        None => ValidationOutcome::fail(name, format!("Port {} was not probed", port)),
    }
}
