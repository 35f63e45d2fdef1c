use std::{fs, path::Path, rc::Rc};

use serde::Deserialize;
use wenjin::{Error, Imports, Instance, Module, Value};

#[derive(Deserialize, Clone)]
struct ValueJSON {
    r#type: String,
    value: String,
}

#[derive(Deserialize, Clone)]
#[serde(tag = "type")]
enum Act {
    #[serde(rename = "invoke")]
    Invoke { field: String, #[serde(default)] args: Vec<ValueJSON> },
    #[serde(rename = "get")]
    Get { field: String },
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum Command {
    #[serde(rename = "module")]
    Module { text: String },
    #[serde(rename = "action")]
    Action { action: Act },
    #[serde(rename = "assert_return")]
    AssertReturn { action: Act, expected: Vec<ValueJSON> },
    #[serde(rename = "assert_trap")]
    AssertTrap { action: Act, text: String },
    #[serde(rename = "assert_exhaustion")]
    AssertExhaustion { action: Act },
    #[serde(rename = "assert_invalid")]
    AssertInvalid { text: String, expected: String },
    #[serde(rename = "assert_malformed")]
    AssertMalformed { bytes: String, expected: String },
    #[serde(rename = "assert_unlinkable")]
    AssertUnlinkable { text: String, expected: String },
}

#[derive(Deserialize)]
struct Scenario {
    commands: Vec<Command>,
}

fn parse_value(v: &ValueJSON) -> Value {
    let nan = v.value == "nan";
    match v.r#type.as_str() {
        "i32" => Value::I32(v.value.parse::<i64>().expect("i32 literal") as i32),
        "i64" => Value::I64(v.value.parse::<i128>().expect("i64 literal") as i64),
        "f32" if nan => Value::F32(f32::NAN),
        "f64" if nan => Value::F64(f64::NAN),
        "f32" => Value::F32(v.value.parse().expect("f32 literal")),
        "f64" => Value::F64(v.value.parse().expect("f64 literal")),
        other => panic!("unknown value type: {}", other),
    }
}

fn same_value(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::F32(a), Value::F32(e)) => (a.is_nan() && e.is_nan()) || a.to_bits() == e.to_bits(),
        (Value::F64(a), Value::F64(e)) => (a.is_nan() && e.is_nan()) || a.to_bits() == e.to_bits(),
        _ => actual == expected,
    }
}

fn parse_hex(text: &str) -> Vec<u8> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    digits.chunks(2)
        .map(|pair| u8::from_str_radix(std::str::from_utf8(pair).unwrap(), 16).expect("hex byte"))
        .collect()
}

fn compile(text: &str) -> Result<Module, Error> {
    let bytes = wat::parse_str(text).map_err(|e| Error::Config(e.to_string()))?;
    Module::compile(bytes)
}

struct Runner {
    module: Option<Rc<Module>>,
    instance: Option<Instance>,
}

impl Runner {
    fn instance(&mut self) -> Result<&Instance, String> {
        // A trap poisons the instance, so later commands get a fresh one.
        if self.instance.as_ref().map_or(true, Instance::is_poisoned) {
            let module = self.module.clone().ok_or("no module defined")?;
            let inst = Instance::instantiate(module, &Imports::new())
                .map_err(|e| format!("instantiate failed: {}", e))?;
            self.instance = Some(inst);
        }
        self.instance.as_ref().ok_or_else(|| "no instance".to_string())
    }

    fn exec(&mut self, action: &Act) -> Result<Result<Vec<Value>, Error>, String> {
        let inst = self.instance()?;
        Ok(match action {
            Act::Invoke { field, args } => {
                let args: Vec<Value> = args.iter().map(parse_value).collect();
                inst.invoke(field, &args)
            }
            Act::Get { field } => inst.global(field)
                .map(|v| vec![v])
                .ok_or_else(|| Error::UnknownExport(field.clone())),
        })
    }

    fn run(&mut self, cmd: &Command) -> Result<(), String> {
        match cmd {
            Command::Module { text } => {
                let module = compile(text).map_err(|e| format!("compile failed: {}", e))?;
                self.module = Some(Rc::new(module));
                self.instance = None;
                self.instance().map(|_| ())
            }
            Command::Action { action } => {
                self.exec(action)?.map(|_| ()).map_err(|e| e.to_string())
            }
            Command::AssertReturn { action, expected } => {
                let results = self.exec(action)?.map_err(|e| e.to_string())?;
                let expected: Vec<Value> = expected.iter().map(parse_value).collect();
                if results.len() != expected.len() {
                    return Err(format!("result count mismatch: expected {}, got {}", expected.len(), results.len()));
                }
                for (i, (r, e)) in results.iter().zip(&expected).enumerate() {
                    if !same_value(r, e) {
                        return Err(format!("result[{}] mismatch: expected {}, got {}", i, e, r));
                    }
                }
                Ok(())
            }
            Command::AssertTrap { action, text } => match self.exec(action)? {
                Err(Error::Trap(trap)) if trap.message().starts_with(text.as_str()) => Ok(()),
                Err(Error::Trap(trap)) => Err(format!("message mismatch: expected '{}', got '{}'", text, trap)),
                Err(e) => Err(format!("wrong error type, expected trap '{}': {}", text, e)),
                Ok(_) => Err(format!("expected trap: '{}'", text)),
            },
            Command::AssertExhaustion { action } => match self.exec(action)? {
                Err(e) if e.trap_kind() == Some(wenjin::Trap::StackOverflow) => Ok(()),
                _ => Err("expected exhaustion".into()),
            },
            Command::AssertInvalid { text, expected } => match compile(text) {
                Err(Error::Validation { msg, .. }) if msg == expected.as_str() => Ok(()),
                Err(e) => Err(format!("message mismatch: expected '{}', got '{}'", expected, e)),
                Ok(_) => Err(format!("expected validation error: '{}'", expected)),
            },
            Command::AssertMalformed { bytes, expected } => match Module::compile(parse_hex(bytes)) {
                Err(Error::Malformed(msg)) if msg == expected.as_str() => Ok(()),
                Err(e) => Err(format!("message mismatch: expected '{}', got '{}'", expected, e)),
                Ok(_) => Err(format!("expected malformed: '{}'", expected)),
            },
            Command::AssertUnlinkable { text, expected } => {
                let module = compile(text).map_err(|e| format!("compile failed: {}", e))?;
                match Instance::instantiate(Rc::new(module), &Imports::new()) {
                    Err(e) if e.to_string().starts_with(expected.as_str()) => Ok(()),
                    Err(e) => Err(format!("message mismatch: expected '{}', got '{}'", expected, e)),
                    Ok(_) => Err(format!("expected unlinkable: '{}'", expected)),
                }
            }
        }
    }
}

fn run_scenario_file(path: &Path) -> Result<(u32, u32), String> {
    let text = fs::read_to_string(path).map_err(|e| format!("failed to read json: {}", e))?;
    let scenario: Scenario = serde_json::from_str(&text).map_err(|e| format!("failed to parse json: {}", e))?;

    let mut runner = Runner { module: None, instance: None };
    let mut passes = 0u32;
    let mut failures = 0u32;
    for (i, cmd) in scenario.commands.iter().enumerate() {
        match runner.run(cmd) {
            Ok(()) => passes += 1,
            Err(e) => {
                eprintln!("[{}:{}] {}", path.display(), i, e);
                failures += 1;
            }
        }
    }
    Ok((passes, failures))
}

#[test]
fn run_scenarios() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/scenarios");
    let mut paths: Vec<_> = fs::read_dir(&dir)
        .expect("failed to read scenario directory")
        .map(|entry| entry.expect("failed to read entry").path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();
    assert!(!paths.is_empty(), "no scenarios found in {}", dir.display());

    let mut total_passes = 0;
    let mut total_failures = 0;
    for path in &paths {
        match run_scenario_file(path) {
            Ok((passes, failures)) => {
                println!("{}: {} passed, {} failed", path.display(), passes, failures);
                total_passes += passes;
                total_failures += failures;
            }
            Err(e) => {
                eprintln!("{}: {}", path.display(), e);
                total_failures += 1;
            }
        }
    }
    println!("\nTotal: {} passed, {} failed", total_passes, total_failures);
    assert_eq!(total_failures, 0, "{} scenario commands failed", total_failures);
}
