//! Demo driver for invocation groups, scope aggregation, and the sandbox.
//!
//! ```text
//! tandem-demo sleepers --mode sequential
//! tandem-demo failing --catch --log-format json
//! tandem-demo scopes
//! tandem-demo sandbox
//! ```

use std::cell::RefCell;
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tandem_core::{CancelToken, ResultMap, Retry, Value};
use tandem_engine::logging::{setup_logging, LogFormat};
use tandem_engine::{
    Args, Call, Engine, Invocation, Member, Operand, Remote, RunnerConfig, Sandbox, Scope,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Two sleeping operations that overlap when run concurrently.
    Sleepers,
    /// One operation fails while a sibling waits; the sibling is interrupted.
    Failing,
    /// Power supplies entered as one scope around a measurement group.
    Scopes,
    /// A single-threaded bench instrument shared through a sandbox.
    Sandbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Concurrent,
    Sequential,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a tandem demo scenario")]
struct Cli {
    #[arg(value_enum, default_value_t = Scenario::Sleepers)]
    scenario: Scenario,

    /// Runner used for every group in the scenario.
    #[arg(long, value_enum, env = "TANDEM_MODE", default_value_t = Mode::Concurrent)]
    mode: Mode,

    /// Collect operation errors instead of raising them.
    #[arg(long, default_value_t = false)]
    catch: bool,

    /// Bare level or full filter directive string.
    #[arg(long, env = "TANDEM_LOG", default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, env = "TANDEM_LOG_FORMAT", default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Completion poll interval of the concurrent runner, in milliseconds.
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
}

struct Demo {
    engine: Engine,
    mode: Mode,
    catch: bool,
}

impl Demo {
    fn run_group(&self, invocation: Invocation) -> anyhow::Result<tandem_engine::Invoked> {
        let invocation = invocation.catch(self.catch);
        let invoked = match self.mode {
            Mode::Concurrent => self.engine.concurrently(invocation)?,
            Mode::Sequential => self.engine.sequentially(invocation)?,
        };
        Ok(invoked)
    }

    fn results(&self, invocation: Invocation) -> anyhow::Result<ResultMap> {
        self.run_group(invocation)?
            .into_results()
            .ok_or_else(|| anyhow::anyhow!("expected a callable group"))
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

fn sleeper(name: &'static str, secs: f64, value: i64) -> Call {
    Call::new(name, move |token: &CancelToken| {
        token.wait(Duration::from_secs_f64(secs))?;
        Ok(value)
    })
}

fn sleepers(demo: &Demo) -> anyhow::Result<ResultMap> {
    demo.results(
        Invocation::new()
            .add(sleeper("f1", 0.5, 1))
            .add(sleeper("f2", 1.0, 2))
            .name("sleepers"),
    )
}

fn failing(demo: &Demo) -> anyhow::Result<ResultMap> {
    let calibrate = Call::new("calibrate", |token: &CancelToken| -> anyhow::Result<()> {
        token.wait(Duration::from_millis(200))?;
        anyhow::bail!("calibration standard not connected")
    });
    demo.results(
        Invocation::new()
            .add(calibrate)
            .add(sleeper("warmup", 30.0, 1))
            .add(sleeper("quick", 0.05, 7))
            .name("failing"),
    )
}

struct Supply {
    label: &'static str,
    volts: f64,
    on: AtomicBool,
}

impl Scope for Supply {
    fn enter(&self, token: &CancelToken) -> anyhow::Result<()> {
        token.wait(Duration::from_millis(150))?;
        self.on.store(true, Ordering::SeqCst);
        tracing::info!(supply = self.label, volts = self.volts, "output on");
        Ok(())
    }

    fn exit(&self) -> anyhow::Result<()> {
        self.on.store(false, Ordering::SeqCst);
        tracing::info!(supply = self.label, "output off");
        Ok(())
    }

    fn name(&self) -> String {
        self.label.to_string()
    }
}

fn scopes(demo: &Demo) -> anyhow::Result<ResultMap> {
    let core = Arc::new(Supply {
        label: "core",
        volts: 0.9,
        on: AtomicBool::new(false),
    });
    let io = Arc::new(Supply {
        label: "io",
        volts: 3.3,
        on: AtomicBool::new(false),
    });

    let group = demo
        .run_group(
            Invocation::new()
                .add(Operand::scope(Arc::clone(&core)))
                .add(Operand::scope(Arc::clone(&io)))
                .name("supplies"),
        )?
        .into_scopes()
        .ok_or_else(|| anyhow::anyhow!("expected a scope group"))?;

    let entered = group.enter()?;
    let measured = {
        let core = Arc::clone(&core);
        let io = Arc::clone(&io);
        demo.results(
            Invocation::new()
                .named(
                    "core_on",
                    Call::new("core_on", move |_: &CancelToken| Ok(core.on.load(Ordering::SeqCst))),
                )
                .named(
                    "io_on",
                    Call::new("io_on", move |_: &CancelToken| Ok(io.on.load(Ordering::SeqCst))),
                ),
        )
    };
    entered.exit()?;
    measured
}

/// Instrument driver state that must never leave its thread.
struct Bench {
    setpoint: f64,
    history: Rc<RefCell<Vec<f64>>>,
    flaky_reads: u32,
}

impl Remote for Bench {
    fn get(&mut self, member: &str) -> anyhow::Result<Member> {
        match member {
            "setpoint" => Ok(Value::Float(self.setpoint).into()),
            "history" => Ok(Value::from(self.history.borrow().clone()).into()),
            _ => anyhow::bail!("bench has no member {member}"),
        }
    }

    fn set(&mut self, member: &str, value: Value) -> anyhow::Result<()> {
        match (member, value.as_float()) {
            ("setpoint", Some(v)) => {
                self.setpoint = v;
                self.history.borrow_mut().push(v);
                Ok(())
            }
            _ => anyhow::bail!("cannot set {member} to {}", value.kind()),
        }
    }

    fn call(&mut self, method: &str, _args: Args) -> anyhow::Result<Member> {
        match method {
            "measure" if self.flaky_reads > 0 => {
                self.flaky_reads -= 1;
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "bus timeout").into())
            }
            "measure" => Ok(Value::Float(self.setpoint * 0.98).into()),
            _ => anyhow::bail!("bench has no method {method}"),
        }
    }
}

fn sandbox(demo: &Demo) -> anyhow::Result<ResultMap> {
    let bench = Arc::new(Sandbox::new(|| {
        Ok(Bench {
            setpoint: 0.0,
            history: Rc::default(),
            flaky_reads: 2,
        })
    })?);

    let attempts = Arc::new(AtomicU32::new(0));
    let op = |name: &'static str, setpoint: f64| {
        let bench = Arc::clone(&bench);
        let attempts = Arc::clone(&attempts);
        Call::new(name, move |token: &CancelToken| {
            bench.set("setpoint", setpoint)?;
            let reading = Retry::on::<std::io::Error>()
                .tries(4)
                .delay(Duration::from_millis(20))
                .with_token(token.clone())
                .label(name)
                .call(|| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    bench.call("measure", Args::new())?.into_value().map_err(Into::into)
                })?;
            Ok(reading)
        })
    };

    let mut results = demo.results(
        Invocation::new()
            .add(op("low", 1.0))
            .add(op("high", 5.0))
            .flatten(false)
            .name("bench"),
    )?;
    results.insert(
        "history".to_string(),
        bench.get("history")?.into_value()?,
    );
    results.insert(
        "measure_attempts".to_string(),
        Value::from(attempts.load(Ordering::SeqCst)),
    );
    Ok(results)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = setup_logging(&cli.log_level, cli.log_format) {
        eprintln!("failed to initialize logging: {err:#}");
        return ExitCode::FAILURE;
    }

    let config = RunnerConfig {
        poll_interval: Duration::from_millis(cli.poll_ms.max(1)),
        ..RunnerConfig::default()
    };
    let demo = Demo {
        engine: Engine::new(config),
        mode: cli.mode,
        catch: cli.catch,
    };

    let outcome = match cli.scenario {
        Scenario::Sleepers => sleepers(&demo),
        Scenario::Failing => failing(&demo),
        Scenario::Scopes => scopes(&demo),
        Scenario::Sandbox => sandbox(&demo),
    };

    match outcome.and_then(|results| Ok(serde_json::to_string_pretty(&results)?)) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(scenario = ?cli.scenario, "{err:#}");
            ExitCode::FAILURE
        }
    }
}
