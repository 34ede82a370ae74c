//! Randomized concurrency stress test for the Orca engine.
//!
//! Each cycle builds a two-arm mock lab joined by a single-slot hub, runs a
//! workflow of labware threads with shuffled method orders, and checks that
//! no labware is ever seen on two locations, that every thread completes on
//! its end location, and that no reservation outlives its thread.
//!
//! Usage:
//!   cargo run --bin stress_test -- [--cycles N] [--threads N]

use orca_core::{Engine, EngineBuilder, SchedulerOptions};
use orca_runtime::{Capability, MockInstrument, MockTransporter};
use orca_schema::{
    ActionTemplate, LabwareSection, MethodTemplate, ResourceName, TemplateName, ThreadTemplate,
    WorkflowTemplate,
};
use orca_store::LabwareThreadStatus;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_THREADS: usize = 6;
const CYCLE_TIMEOUT: Duration = Duration::from_secs(60);
const METHODS: [&str; 3] = ["wash", "read", "incubate"];

fn arg(args: &[String], name: &str, default: usize) -> usize {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn method_template(method: &str) -> MethodTemplate {
    let action = match method {
        "wash" => ActionTemplate::on_resource("washer", "wash"),
        "read" => ActionTemplate::on_resource("reader", "read")
            .with_option("wavelength", serde_json::json!(450)),
        _ => ActionTemplate::on_pool("incubators", "incubate"),
    };
    MethodTemplate::new(vec![action])
}

async fn build_lab(threads: usize) -> Engine {
    let pads: Vec<String> = (1..=threads).map(|i| format!("pad_{i}")).collect();
    let mut builder = EngineBuilder::new().with_options(SchedulerOptions::fast());

    for (location, resource) in [
        ("washer_1", "washer"),
        ("reader_1", "reader"),
        ("incubator_1_1", "incubator_1"),
        ("incubator_2_1", "incubator_2"),
    ] {
        builder
            .add_location(location, Some(ResourceName::new(resource)))
            .expect("add location");
        builder
            .add_resource(Capability::Instrument(Arc::new(
                MockInstrument::new(resource).with_delay(Duration::from_millis(2)),
            )))
            .expect("add instrument");
    }

    let mut arm_a: Vec<&str> = pads.iter().map(String::as_str).collect();
    arm_a.extend(["washer_1", "reader_1", "hub"]);
    let arm_b = ["hub", "incubator_1_1", "incubator_2_1", "park_1", "park_2"];
    builder
        .add_resource(Capability::Transporter(Arc::new(
            MockTransporter::new("arm_a", arm_a).with_delay(Duration::from_millis(1)),
        )))
        .expect("add arm_a")
        .add_resource(Capability::Transporter(Arc::new(
            MockTransporter::new("arm_b", arm_b).with_delay(Duration::from_millis(1)),
        )))
        .expect("add arm_b");

    builder
        .add_pool(
            "incubators",
            vec![ResourceName::new("incubator_1"), ResourceName::new("incubator_2")],
        )
        .add_labware("plate", LabwareSection::default());

    // Methods are per thread; a shared method name would join the threads
    // into one multi-labware action.
    let mut rng = rand::thread_rng();
    let mut names = Vec::with_capacity(threads);
    for pad in &pads {
        let mut methods: Vec<String> = Vec::with_capacity(METHODS.len());
        for method in METHODS {
            let name = format!("{method}_{pad}");
            builder.add_method(name.as_str(), method_template(method));
            methods.push(name);
        }
        methods.shuffle(&mut rng);
        methods.truncate(rng.gen_range(1..=METHODS.len()));

        let name = format!("run_{pad}");
        builder.add_thread(
            name.as_str(),
            ThreadTemplate::new("plate", pad.as_str(), pad.as_str()).with_methods(methods),
        );
        names.push(TemplateName::new(name));
    }
    builder.add_workflow("stress", WorkflowTemplate { threads: names });

    builder.build().await.expect("build engine")
}

/// Sample occupancy until `done`, counting labware seen on two locations.
async fn monitor(engine: Arc<Engine>, done: Arc<AtomicBool>, violations: Arc<AtomicU64>) {
    let poll = engine.context().options.tick_interval;
    while !done.load(Ordering::SeqCst) {
        let mut seen: HashMap<_, usize> = HashMap::new();
        for location in engine.context().map.locations() {
            if let Some(labware) = location.occupant() {
                *seen.entry(labware).or_default() += 1;
            }
        }
        for (labware, count) in seen {
            if count > 1 {
                eprintln!("  OCCUPANCY VIOLATION: {labware} seen on {count} locations");
                violations.fetch_add(1, Ordering::SeqCst);
            }
        }
        tokio::time::sleep(poll).await;
    }
}

async fn run_cycle(threads: usize, cycle: usize, violations: &Arc<AtomicU64>) -> Result<(), String> {
    let engine = Arc::new(build_lab(threads).await);
    let run = engine
        .create_workflow("stress")
        .map_err(|e| format!("cycle {cycle}: CREATE FAILED: {e}"))?;

    let done = Arc::new(AtomicBool::new(false));
    let watcher = tokio::spawn(monitor(
        Arc::clone(&engine),
        Arc::clone(&done),
        Arc::clone(violations),
    ));

    let outcome = tokio::time::timeout(CYCLE_TIMEOUT, engine.run_workflow(&run)).await;
    done.store(true, Ordering::SeqCst);
    let _ = watcher.await;

    let result = match outcome {
        Err(_) => {
            engine.stop_all();
            Err(format!("cycle {cycle}: STALLED after {}s", CYCLE_TIMEOUT.as_secs()))
        }
        Ok(Err(e)) => Err(format!("cycle {cycle}: WORKFLOW FAILED: {e}")),
        Ok(Ok(_)) => check_final_state(&engine, &run.threads, cycle),
    };
    if let Err(e) = engine.shutdown().await {
        eprintln!("  cycle {cycle}: SHUTDOWN FAILED: {e}");
    }
    result
}

fn check_final_state(
    engine: &Engine,
    threads: &[Arc<orca_core::LabwareThread>],
    cycle: usize,
) -> Result<(), String> {
    let ctx = engine.context();
    for thread in threads {
        if thread.status() != LabwareThreadStatus::Completed {
            return Err(format!(
                "cycle {cycle}: thread {} ended {}",
                thread.id(),
                thread.status()
            ));
        }
        let end = ctx
            .map
            .get_location(thread.end_location())
            .map_err(|e| format!("cycle {cycle}: {e}"))?;
        if end.occupant().as_ref() != Some(thread.labware()) {
            return Err(format!(
                "cycle {cycle}: {} is not on its end location {}",
                thread.labware(),
                thread.end_location()
            ));
        }
    }
    let leaked = ctx.reservations.granted_count();
    if leaked > 0 {
        return Err(format!("cycle {cycle}: RESERVATION LEAK: {leaked} grants remain"));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ORCA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cycles = arg(&args, "--cycles", 50);
    let threads = arg(&args, "--threads", 4).clamp(1, MAX_THREADS);

    println!("Orca stress test: {cycles} cycles, {threads} labware threads");
    println!("============================================");

    let violations = Arc::new(AtomicU64::new(0));
    let mut failures = 0u64;
    let mut elapsed = Duration::ZERO;

    for cycle in 1..=cycles {
        let t0 = Instant::now();
        if let Err(msg) = run_cycle(threads, cycle, &violations).await {
            eprintln!("  {msg}");
            failures += 1;
        }
        elapsed += t0.elapsed();
        if cycle % 10 == 0 {
            println!(
                "  cycle {cycle}/{cycles}: {:.1}s elapsed, {failures} failures",
                elapsed.as_secs_f64()
            );
        }
    }

    let violations = violations.load(Ordering::SeqCst);
    println!();
    println!("============================================");
    println!("Results: {cycles} cycles, {failures} failures");
    println!(
        "  workflow: {:.3}s total, {:.3}ms avg",
        elapsed.as_secs_f64(),
        elapsed.as_secs_f64() * 1000.0 / cycles.max(1) as f64
    );
    println!("  occupancy violations: {violations}");

    if failures > 0 || violations > 0 {
        eprintln!("\nSTRESS TEST FAILED");
        std::process::exit(1);
    } else {
        println!("\nSTRESS TEST PASSED");
    }
}
