//! Lua sandbox creation
//!
//! Pipeline scripts are evaluated in a restricted Lua state without
//! filesystem, process or network access. The `pipeline` helper module is
//! always injected since every definition script is expected to use it.

use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib, Table, Value};

/// Create a restricted Lua sandbox
///
/// Only tables, strings, math and coroutines are available. `io`, `os`,
/// `package` and `debug` are never loaded, and `require`, `dofile` and
/// `loadfile` are removed from the globals.
///
/// # Example
/// ```no_run
/// use conveyor_lua::sandbox::create_sandbox;
///
/// let lua = create_sandbox()?;
/// let def: mlua::Table = lua
///     .load(r#"return pipeline.define({ name = "api", repository = "acme/api", stages = {} })"#)
///     .eval()?;
/// let name: String = def.get("name")?;
/// assert_eq!(name, "api");
/// # Ok::<(), mlua::Error>(())
/// ```
pub fn create_sandbox() -> LuaResult<Lua> {
    // Explicitly exclude: IO, OS, PACKAGE, DEBUG
    let lua = unsafe {
        Lua::unsafe_new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE,
            LuaOptions::default(),
        )
    };

    lua.globals().set("require", mlua::Nil)?;
    lua.globals().set("dofile", mlua::Nil)?;
    lua.globals().set("loadfile", mlua::Nil)?;

    register_pipeline_module(&lua)?;

    Ok(lua)
}

/// Register the `pipeline` helper module
fn register_pipeline_module(lua: &Lua) -> LuaResult<()> {
    let pipeline = lua.create_table()?;

    // pipeline.define(definition) - returns the definition table as-is
    let define_fn = lua.create_function(|_, definition: Table| Ok(definition))?;
    pipeline.set("define", define_fn)?;

    // pipeline.stage(id, capability, opts) - builds a stage table
    let stage_fn = lua.create_function(
        |lua, (id, capability, opts): (String, String, Option<Table>)| {
            let stage = match opts {
                Some(opts) => opts,
                None => lua.create_table()?,
            };
            stage.set("id", id)?;
            stage.set("capability", capability)?;
            Ok(stage)
        },
    )?;
    pipeline.set("stage", stage_fn)?;

    // pipeline.gate(metric, comparator, threshold, warn) - builds a gate condition
    let gate_fn = lua.create_function(
        |lua, (metric, comparator, threshold, warn): (String, String, f64, Option<f64>)| {
            let gate = lua.create_table()?;
            gate.set("metric", metric)?;
            gate.set("comparator", comparator)?;
            gate.set("threshold", threshold)?;
            gate.set("warn", warn)?;
            Ok(gate)
        },
    )?;
    pipeline.set("gate", gate_fn)?;

    // pipeline.canary(steps, opts) - builds a canary policy table
    let canary_fn = lua.create_function(|lua, (steps, opts): (Table, Option<Table>)| {
        let canary = match opts {
            Some(opts) => opts,
            None => lua.create_table()?,
        };
        canary.set("steps", steps)?;
        Ok(canary)
    })?;
    pipeline.set("canary", canary_fn)?;

    let builder_fn = lua.create_function(|lua, ()| create_pipeline_builder(lua))?;
    pipeline.set("builder", builder_fn)?;

    lua.globals().set("pipeline", pipeline)?;

    Ok(())
}

/// Append `value` to the array stored under `key`, creating it on first use
fn push_to(lua: &Lua, builder: &Table, key: &str, value: Value) -> LuaResult<()> {
    let list: Table = match builder.get(key) {
        Ok(t) => t,
        Err(_) => {
            let t = lua.create_table()?;
            builder.set(key, t.clone())?;
            t
        }
    };
    list.push(value)
}

/// Create a pipeline builder instance with fluent API methods
fn create_pipeline_builder(lua: &Lua) -> LuaResult<Table> {
    let builder = lua.create_table()?;
    let metatable = lua.create_table()?;

    for field in ["name", "repository", "description"] {
        let key = format!("_{}", field);
        let setter = lua.create_function(move |_, (builder, value): (Table, String)| {
            builder.set(key.as_str(), value)?;
            Ok(builder)
        })?;
        metatable.set(field, setter)?;
    }

    let stage_fn = lua.create_function(|lua, (builder, stage): (Table, Table)| {
        push_to(lua, &builder, "_stages", Value::Table(stage))?;
        Ok(builder)
    })?;
    metatable.set("stage", stage_fn)?;

    let gate_fn = lua.create_function(|lua, (builder, gate): (Table, Value)| {
        push_to(lua, &builder, "_gates", gate)?;
        Ok(builder)
    })?;
    metatable.set("gate", gate_fn)?;

    let canary_fn = lua.create_function(|_, (builder, canary): (Table, Table)| {
        builder.set("_canary", canary)?;
        Ok(builder)
    })?;
    metatable.set("canary", canary_fn)?;

    // build() converts builder to pipeline definition table
    let build_fn = lua.create_function(|lua, builder: Table| {
        let definition = lua.create_table()?;
        for field in ["name", "repository", "description", "stages", "gates", "canary"] {
            let value: Value = builder.get(format!("_{}", field))?;
            if !value.is_nil() {
                definition.set(field, value)?;
            }
        }
        Ok(definition)
    })?;
    metatable.set("build", build_fn)?;

    // Set __index to the metatable itself so methods are accessible
    metatable.set("__index", metatable.clone())?;
    builder.set_metatable(Some(metatable))?;

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_basic_lua() {
        let lua = create_sandbox().unwrap();

        let result: i32 = lua
            .load(
                r#"
                local t = {a = 1, b = 2}
                return t.a + t.b
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(result, 3);

        let result: String = lua.load(r#"return string.upper("hello")"#).eval().unwrap();
        assert_eq!(result, "HELLO");
    }

    #[test]
    fn test_sandbox_no_io() {
        let lua = create_sandbox().unwrap();

        let has_io: bool = lua.load(r#"return io ~= nil"#).eval().unwrap();
        assert!(!has_io);

        let has_os: bool = lua.load(r#"return os ~= nil"#).eval().unwrap();
        assert!(!has_os);
    }

    #[test]
    fn test_sandbox_no_require() {
        let lua = create_sandbox().unwrap();

        let result: LuaResult<()> = lua.load(r#"require("os")"#).exec();
        assert!(result.is_err());

        let result: LuaResult<()> = lua.load(r#"dofile("/etc/passwd")"#).exec();
        assert!(result.is_err());
    }

    #[test]
    fn test_stage_and_gate_helpers() {
        let lua = create_sandbox().unwrap();

        let (id, capability, env): (String, String, String) = lua
            .load(
                r#"
            local s = pipeline.stage("ship", "deploy", { environment = "prod" })
            return s.id, s.capability, s.environment
        "#,
            )
            .eval()
            .unwrap();
        assert_eq!(id, "ship");
        assert_eq!(capability, "deploy");
        assert_eq!(env, "prod");

        let (metric, warn): (String, f64) = lua
            .load(
                r#"
            local g = pipeline.gate("coverage", ">=", 80, 90)
            return g.metric, g.warn
        "#,
            )
            .eval()
            .unwrap();
        assert_eq!(metric, "coverage");
        assert_eq!(warn, 90.0);
    }

    #[test]
    fn test_builder_collects_fields() {
        let lua = create_sandbox().unwrap();

        let (name, stages, gates): (String, i64, i64) = lua
            .load(
                r#"
            local def = pipeline.builder()
                :name("api")
                :repository("acme/api")
                :stage(pipeline.stage("build", "build"))
                :stage(pipeline.stage("analyze", "analyze", { depends_on = {"build"} }))
                :gate("bugs <= 0")
                :build()
            return def.name, #def.stages, #def.gates
        "#,
            )
            .eval()
            .unwrap();
        assert_eq!(name, "api");
        assert_eq!(stages, 2);
        assert_eq!(gates, 1);
    }
}
