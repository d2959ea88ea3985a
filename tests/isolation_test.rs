mod helpers;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use strata::{MemoryEngine, RequestContext, SearchOptions, StoreRequest};

const PROJECTS: [&str; 3] = ["alpha", "beta", "gamma"];
const WORDS: [&str; 8] = [
    "cache", "retry", "schema", "deploy", "token", "parser", "socket", "index",
];

fn sentence(rng: &mut StdRng) -> String {
    (0..5)
        .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

async fn worker(engine: Arc<MemoryEngine>, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..40 {
        let project = PROJECTS[rng.gen_range(0..PROJECTS.len())];
        let ctx = RequestContext::new(project).with_user(format!("worker-{seed}"));
        match rng.gen_range(0..10) {
            0..=3 => {
                let text = sentence(&mut rng);
                engine.store(&ctx, &text, StoreRequest::default()).await.unwrap();
            }
            4..=7 => {
                let query = sentence(&mut rng);
                let response = engine
                    .search(&ctx, &query, SearchOptions::default())
                    .await
                    .unwrap();
                for result in &response.results {
                    assert_eq!(result.record.project_id, project, "leak into {project}");
                }
            }
            8 => {
                engine.switch_project(project).await.unwrap();
            }
            _ => {
                engine.evict_idle_contexts().await.unwrap();
            }
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_operations_never_cross_projects() {
    let engine = Arc::new(helpers::local_engine().await);

    let tasks: Vec<_> = (0..6u64)
        .map(|seed| tokio::spawn(worker(Arc::clone(&engine), seed)))
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let metrics = engine.get_metrics().await.unwrap();
    assert!(metrics.monitor.isolation_checks > 0);
    assert_eq!(metrics.monitor.isolation_violations, 0);

    // Every stored row landed in the project it was written to.
    for project in PROJECTS {
        let snapshot = engine.local().project_snapshot(project).await.unwrap();
        assert!(snapshot.iter().all(|s| s.record.project_id == project));
    }
}

#[tokio::test]
async fn evicted_contexts_reload_on_demand() {
    let mut config = helpers::test_config();
    config.isolation.idle_eviction_secs = 0;
    let engine = helpers::engine_with(config, None).await;
    let ctx = RequestContext::new("alpha");
    engine
        .store(&ctx, "switch statements must be exhaustive", StoreRequest::default())
        .await
        .unwrap();
    engine.search(&ctx, "exhaustive", SearchOptions::default()).await.unwrap();
    engine.switch_project("beta").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let evicted = engine.evict_idle_contexts().await.unwrap();
    assert_eq!(evicted, vec!["alpha".to_string()]);
    assert_eq!(engine.get_metrics().await.unwrap().loaded_projects, vec!["beta".to_string()]);

    let hits = engine.search(&ctx, "exhaustive", SearchOptions::default()).await.unwrap();
    assert_eq!(hits.results.len(), 1);
}
