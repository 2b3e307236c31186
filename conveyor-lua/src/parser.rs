//! Pipeline definition parser
//!
//! Evaluates a Lua pipeline script in the sandbox and converts the returned
//! table into a [`PipelineDefinition`]. Lua scripts use snake_case keys
//! (`depends_on`, `timeout`, `max_attempts`); structural validation of the
//! result is left to [`PipelineDefinition::validate`].

use anyhow::{Context, Result, anyhow};
use conveyor_core::domain::gate::{Comparator, GateCondition};
use conveyor_core::domain::pipeline::{
    CanaryPolicy, Capability, DEFAULT_TIMEOUT_SECONDS, PipelineDefinition, RetryPolicy,
    StageDefinition,
};
use mlua::{Table, Value};

use crate::sandbox::create_sandbox;

/// Parse a pipeline definition from Lua source code
///
/// # Example
/// ```no_run
/// use conveyor_lua::parser::parse_pipeline_definition;
///
/// let source = r#"
///     return pipeline.define({
///         name = "api",
///         repository = "acme/api",
///         stages = {
///             pipeline.stage("build", "build", { retry = { max_attempts = 3 } }),
///             pipeline.stage("analyze", "analyze", { depends_on = { "build" } }),
///         },
///         gates = { "bugs <= 0", pipeline.gate("coverage", ">=", 80) },
///     })
/// "#;
///
/// let definition = parse_pipeline_definition(source)?;
/// assert_eq!(definition.stages.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn parse_pipeline_definition(source: &str) -> Result<PipelineDefinition> {
    let lua = create_sandbox().context("Failed to create pipeline sandbox")?;

    let pipeline: Table = lua
        .load(source)
        .eval()
        .context("Failed to evaluate pipeline definition")?;

    let name: String = pipeline
        .get("name")
        .context("Pipeline must have a 'name' field")?;
    let repository: String = pipeline
        .get("repository")
        .context("Pipeline must have a 'repository' field")?;
    let description: Option<String> = pipeline.get("description").ok().flatten();

    let stages = parse_stages(&pipeline)?;
    let gates = parse_gates(&pipeline)?;
    let canary = parse_canary(&pipeline)?;

    Ok(PipelineDefinition {
        name,
        repository,
        description,
        stages,
        gates,
        canary,
    })
}

/// Parse the 'stages' field from pipeline table
fn parse_stages(pipeline: &Table) -> Result<Vec<StageDefinition>> {
    let stages_table: Table = pipeline
        .get("stages")
        .context("Pipeline must have a 'stages' field")?;

    let mut stages = Vec::new();
    for entry in stages_table.sequence_values::<Table>() {
        let stage_table = entry.context("Failed to read stage entry")?;
        stages.push(parse_stage(&stage_table)?);
    }

    if stages.is_empty() {
        return Err(anyhow!("Pipeline must have at least one stage"));
    }

    Ok(stages)
}

fn parse_stage(table: &Table) -> Result<StageDefinition> {
    let id: String = table
        .get("id")
        .context("Stage must have an 'id' field")?;

    let capability: String = table
        .get("capability")
        .with_context(|| format!("Stage '{}' must have a 'capability' field", id))?;
    let capability: Capability = capability
        .parse()
        .with_context(|| format!("Stage '{}' has an invalid capability", id))?;

    let depends_on = string_list(table, "depends_on")
        .with_context(|| format!("Stage '{}' has an invalid 'depends_on' field", id))?;

    let retry = match table.get::<Option<Table>>("retry")? {
        Some(retry) => {
            let defaults = RetryPolicy::default();
            RetryPolicy {
                max_attempts: retry
                    .get::<Option<u32>>("max_attempts")?
                    .unwrap_or(defaults.max_attempts),
                backoff_base_ms: retry
                    .get::<Option<u64>>("backoff_ms")?
                    .unwrap_or(defaults.backoff_base_ms),
            }
        }
        None => RetryPolicy::default(),
    };

    let timeout_seconds = table
        .get::<Option<u64>>("timeout")
        .with_context(|| format!("Stage '{}' timeout must be a number of seconds", id))?
        .unwrap_or(DEFAULT_TIMEOUT_SECONDS);

    Ok(StageDefinition {
        depends_on,
        retry,
        timeout_seconds,
        optional: table.get::<Option<bool>>("optional")?.unwrap_or(false),
        adapter: table.get("adapter")?,
        command: table.get("command")?,
        environment: table.get("environment")?,
        ..StageDefinition::new(id, capability)
    })
}

/// Parse the 'gates' field. Entries are condition tables or strings of the
/// form `"metric <op> threshold"`.
fn parse_gates(pipeline: &Table) -> Result<Vec<GateCondition>> {
    let gates_value: Value = pipeline.get("gates").unwrap_or(Value::Nil);

    let table = match gates_value {
        Value::Nil => return Ok(Vec::new()),
        Value::Table(table) => table,
        _ => return Err(anyhow!("Field 'gates' must be an array of conditions")),
    };

    let mut gates = Vec::new();
    for entry in table.sequence_values::<Value>() {
        let gate = match entry.context("Failed to read gate entry")? {
            Value::String(s) => parse_gate_expression(&s.to_string_lossy())?,
            Value::Table(t) => {
                let metric: String = t.get("metric").context("Gate must have a 'metric' field")?;
                let comparator: String = t
                    .get("comparator")
                    .with_context(|| format!("Gate on '{}' must have a 'comparator'", metric))?;
                let threshold: f64 = t
                    .get("threshold")
                    .with_context(|| format!("Gate on '{}' must have a 'threshold'", metric))?;
                GateCondition {
                    comparator: comparator.parse::<Comparator>().map_err(|e| anyhow!(e))?,
                    threshold,
                    warn: t.get("warn")?,
                    metric,
                }
            }
            _ => return Err(anyhow!("Gate entries must be tables or strings")),
        };
        gates.push(gate);
    }

    Ok(gates)
}

/// Parse `"coverage >= 80"` into a gate condition
fn parse_gate_expression(expression: &str) -> Result<GateCondition> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    let [metric, comparator, threshold] = parts.as_slice() else {
        return Err(anyhow!(
            "Gate expression '{}' must look like 'metric <op> threshold'",
            expression
        ));
    };

    let comparator = comparator.parse::<Comparator>().map_err(|e| anyhow!(e))?;
    let threshold: f64 = threshold
        .parse()
        .with_context(|| format!("Gate threshold '{}' is not a number", threshold))?;

    Ok(GateCondition::new(*metric, comparator, threshold))
}

/// Parse the optional 'canary' table, filling gaps from the default policy
fn parse_canary(pipeline: &Table) -> Result<Option<CanaryPolicy>> {
    let Some(table) = pipeline.get::<Option<Table>>("canary")? else {
        return Ok(None);
    };

    let defaults = CanaryPolicy::default();
    let steps = match table.get::<Option<Table>>("steps")? {
        Some(steps) => steps
            .sequence_values::<u8>()
            .collect::<mlua::Result<Vec<_>>>()
            .context("Canary steps must be percentages")?,
        None => defaults.steps,
    };

    Ok(Some(CanaryPolicy {
        steps,
        observation_window_seconds: table
            .get::<Option<u64>>("observation_window")?
            .unwrap_or(defaults.observation_window_seconds),
        poll_interval_seconds: table
            .get::<Option<u64>>("poll_interval")?
            .unwrap_or(defaults.poll_interval_seconds),
        failure_rate_threshold: table
            .get::<Option<f64>>("failure_rate_threshold")?
            .unwrap_or(defaults.failure_rate_threshold),
    }))
}

/// Read a field holding either a single string or an array of strings
fn string_list(table: &Table, key: &str) -> Result<Vec<String>> {
    match table.get::<Value>(key)? {
        Value::Nil => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.to_string_lossy()]),
        Value::Table(list) => list
            .sequence_values::<String>()
            .collect::<mlua::Result<Vec<_>>>()
            .map_err(Into::into),
        _ => Err(anyhow!("'{}' must be a string or an array of strings", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_pipeline() {
        let source = r#"
            return {
                name = "minimal",
                repository = "acme/minimal",
                stages = {
                    { id = "build", capability = "build" }
                }
            }
        "#;

        let def = parse_pipeline_definition(source).unwrap();
        assert_eq!(def.name, "minimal");
        assert_eq!(def.description, None);
        assert_eq!(def.stages.len(), 1);
        assert_eq!(def.stages[0].timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(def.stages[0].retry, RetryPolicy::default());
        assert!(def.gates.is_empty());
        assert!(def.canary.is_none());
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_parse_full_pipeline() {
        let source = r#"
            return pipeline.define({
                name = "release",
                repository = "acme/api",
                description = "Build, gate and ship",
                stages = {
                    pipeline.stage("checkout", "custom", { command = "git fetch" }),
                    pipeline.stage("build", "build", {
                        depends_on = "checkout",
                        retry = { max_attempts = 3, backoff_ms = 250 },
                        timeout = 600,
                    }),
                    pipeline.stage("lint", "custom", { depends_on = { "checkout" }, optional = true }),
                    pipeline.stage("analyze", "analyze", { depends_on = { "build" } }),
                    pipeline.stage("package", "package", { depends_on = { "analyze" } }),
                    pipeline.stage("deploy", "deploy", { depends_on = { "package" }, environment = "prod" }),
                },
                gates = {
                    "bugs <= 0",
                    pipeline.gate("coverage", ">=", 80, 90),
                },
                canary = pipeline.canary({ 25, 100 }, { observation_window = 30 }),
            })
        "#;

        let def = parse_pipeline_definition(source).unwrap();
        assert_eq!(def.description.as_deref(), Some("Build, gate and ship"));
        assert_eq!(def.stages.len(), 6);

        let build = def.stage("build").unwrap();
        assert_eq!(build.depends_on, vec!["checkout"]);
        assert_eq!(build.retry.max_attempts, 3);
        assert_eq!(build.retry.backoff_base_ms, 250);
        assert_eq!(build.timeout_seconds, 600);
        assert!(def.stage("lint").unwrap().optional);
        assert_eq!(
            def.stage("checkout").unwrap().command.as_deref(),
            Some("git fetch")
        );
        assert_eq!(def.stage("deploy").unwrap().environment.as_deref(), Some("prod"));

        assert_eq!(def.gates.len(), 2);
        assert_eq!(def.gates[0], GateCondition::new("bugs", Comparator::Le, 0.0));
        assert_eq!(def.gates[1].warn, Some(90.0));

        let canary = def.canary.clone().unwrap();
        assert_eq!(canary.steps, vec![25, 100]);
        assert_eq!(canary.observation_window_seconds, 30);
        assert_eq!(canary.poll_interval_seconds, 5);

        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_parse_builder_pipeline() {
        let source = r#"
            return pipeline.builder()
                :name("svc")
                :repository("acme/svc")
                :stage(pipeline.stage("build", "build"))
                :gate(pipeline.gate("coverage", "ge", 70))
                :build()
        "#;

        let def = parse_pipeline_definition(source).unwrap();
        assert_eq!(def.name, "svc");
        assert_eq!(def.gates[0].comparator, Comparator::Ge);
    }

    #[test]
    fn test_parse_pipeline_missing_repository() {
        let source = r#"
            return { name = "x", stages = { { id = "a", capability = "build" } } }
        "#;

        let err = parse_pipeline_definition(source).unwrap_err();
        assert!(err.to_string().contains("repository"));
    }

    #[test]
    fn test_parse_pipeline_empty_stages() {
        let source = r#"return { name = "x", repository = "acme/x", stages = {} }"#;

        let err = parse_pipeline_definition(source).unwrap_err();
        assert!(err.to_string().contains("at least one stage"));
    }

    #[test]
    fn test_parse_unknown_capability() {
        let source = r#"
            return { name = "x", repository = "acme/x", stages = { { id = "a", capability = "compile" } } }
        "#;

        let err = parse_pipeline_definition(source).unwrap_err();
        assert!(err.to_string().contains("invalid capability"));
    }

    #[test]
    fn test_parse_bad_gate_expression() {
        let source = r#"
            return {
                name = "x", repository = "acme/x",
                stages = { { id = "a", capability = "build" } },
                gates = { "coverage at least 80" },
            }
        "#;

        assert!(parse_pipeline_definition(source).is_err());
    }

    #[test]
    fn test_parse_invalid_lua() {
        assert!(parse_pipeline_definition("this is not valid lua!!!").is_err());
        assert!(parse_pipeline_definition(r#"return "not a table""#).is_err());
    }

    #[test]
    fn test_sandbox_blocks_os_access() {
        let source = r#"
            os.execute("true")
            return { name = "x", repository = "acme/x", stages = { { id = "a", capability = "build" } } }
        "#;

        assert!(parse_pipeline_definition(source).is_err());
    }
}
