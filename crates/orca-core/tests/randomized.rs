//! Seeded random workflows on a two-arm lab joined by a single-slot hub.
//! Occupancy is checked after every coordinator tick while the workflow runs.

use orca_core::{Engine, EngineBuilder, SchedulerOptions};
use orca_runtime::{Capability, MockInstrument, MockTransporter};
use orca_schema::{
    ActionTemplate, LabwareSection, MethodTemplate, ResourceName, TemplateName, ThreadTemplate,
    WorkflowTemplate,
};
use orca_store::{LabwareThreadStatus, WorkflowStatus};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const METHODS: [&str; 3] = ["wash", "read", "incubate"];

fn method_template(method: &str) -> MethodTemplate {
    let action = match method {
        "wash" => ActionTemplate::on_resource("washer", "wash"),
        "read" => ActionTemplate::on_resource("reader", "read"),
        _ => ActionTemplate::on_pool("incubators", "incubate"),
    };
    MethodTemplate::new(vec![action])
}

async fn random_lab(rng: &mut StdRng, threads: usize) -> Engine {
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
            .unwrap()
            .add_resource(Capability::Instrument(Arc::new(
                MockInstrument::new(resource).with_delay(Duration::from_millis(1)),
            )))
            .unwrap();
    }

    let mut arm_a: Vec<&str> = pads.iter().map(String::as_str).collect();
    arm_a.extend(["washer_1", "reader_1", "hub"]);
    builder
        .add_resource(Capability::Transporter(Arc::new(MockTransporter::new("arm_a", arm_a))))
        .unwrap()
        .add_resource(Capability::Transporter(Arc::new(MockTransporter::new(
            "arm_b",
            ["hub", "incubator_1_1", "incubator_2_1", "park_1", "park_2"],
        ))))
        .unwrap();
    builder
        .add_pool(
            "incubators",
            vec![ResourceName::new("incubator_1"), ResourceName::new("incubator_2")],
        )
        .add_labware("plate", LabwareSection::default());

    let mut names = Vec::with_capacity(threads);
    for pad in &pads {
        let mut methods: Vec<String> = METHODS
            .iter()
            .map(|method| {
                let name = format!("{method}_{pad}");
                builder.add_method(name.as_str(), method_template(method));
                name
            })
            .collect();
        methods.shuffle(rng);
        methods.truncate(rng.gen_range(1..=METHODS.len()));

        let name = format!("run_{pad}");
        builder.add_thread(
            name.as_str(),
            ThreadTemplate::new("plate", pad.as_str(), pad.as_str()).with_methods(methods),
        );
        names.push(TemplateName::new(name));
    }
    builder.add_workflow("random", WorkflowTemplate { threads: names });
    builder.build().await.unwrap()
}

/// Labware seen on more than one location, counted once per coordinator tick.
async fn count_double_occupancy(engine: &Engine, done: &AtomicBool) -> usize {
    let mut violations = 0;
    let mut last_tick = None;
    while !done.load(Ordering::SeqCst) {
        let tick = engine.context().coordinator.ticks();
        if last_tick != Some(tick) {
            last_tick = Some(tick);
            let mut seen: HashMap<_, usize> = HashMap::new();
            for location in engine.context().map.locations() {
                if let Some(labware) = location.occupant() {
                    *seen.entry(labware).or_default() += 1;
                }
            }
            violations += seen.values().filter(|&&count| count > 1).count();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    violations
}

#[tokio::test]
async fn seeded_workflows_keep_one_location_per_labware() {
    for seed in [3, 17, 2024] {
        let mut rng = StdRng::seed_from_u64(seed);
        let threads = rng.gen_range(2..=4);
        let engine = random_lab(&mut rng, threads).await;
        let run = engine.create_workflow("random").unwrap();

        let done = AtomicBool::new(false);
        let workflow = async {
            let status = engine.run_workflow(&run).await;
            done.store(true, Ordering::SeqCst);
            status
        };
        let (status, violations) = tokio::time::timeout(Duration::from_secs(30), async {
            tokio::join!(workflow, count_double_occupancy(&engine, &done))
        })
        .await
        .unwrap_or_else(|_| panic!("seed {seed}: workflow did not finish"));

        assert_eq!(status.unwrap(), WorkflowStatus::Completed, "seed {seed}");
        assert_eq!(violations, 0, "seed {seed}");
        for thread in &run.threads {
            assert_eq!(thread.status(), LabwareThreadStatus::Completed, "seed {seed}");
            assert_eq!(&thread.current_location(), thread.end_location(), "seed {seed}");
        }
        assert_eq!(engine.context().reservations.granted_count(), 0, "seed {seed}");
        engine.shutdown().await.unwrap();
    }
}
