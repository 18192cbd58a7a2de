//! End-to-end script policies over the stub driver: abort-on-error,
//! escalation short-circuit, pause/resume ordering.

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::sync::broadcast;
use wheelhouse_artifact_store::ArtifactUploader;
use wheelhouse_core_types::events::RunnerEvent;
use wheelhouse_core_types::{
    EscalationMethod, LocatorSpec, MethodSpec, Script, ScriptStatus, SessionId, Step, StepKind,
};
use wheelhouse_driver::{BrowserDriver, StubDriver};
use wheelhouse_escalation::{EscalationEngine, MockVisionClient, VisionClient};
use wheelhouse_profile_store::ProfileStore;
use wheelhouse_script_engine::{
    ExecutorConfig, RunnerConfig, ScriptRunner, StepExecutor,
};
use wheelhouse_session_center::{CenterConfig, SessionCenter, SessionOptions, StubFactory};

fn click(selector: &str) -> Step {
    Step::new(StepKind::Click {
        locator: Some(LocatorSpec::selector(selector)),
        escalation: None,
    })
}

fn runner_over(
    driver: StubDriver,
    vision: Option<Arc<MockVisionClient>>,
) -> (ScriptRunner, broadcast::Receiver<RunnerEvent>) {
    let driver: Arc<dyn BrowserDriver> = Arc::new(driver);
    let vision = vision.map(|v| v as Arc<dyn VisionClient>);
    let engine = Arc::new(EscalationEngine::new(Arc::clone(&driver), vision));
    let (events, rx) = broadcast::channel(512);
    let session_id = SessionId::new();
    let executor = StepExecutor::new(
        driver,
        engine,
        Arc::new(ArtifactUploader::disabled()),
        session_id.clone(),
        events.clone(),
        ExecutorConfig::default(),
    );
    (
        ScriptRunner::new(executor, session_id, events, RunnerConfig::default()),
        rx,
    )
}

fn drain(rx: &mut broadcast::Receiver<RunnerEvent>) -> Vec<RunnerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn abort_on_error_emits_no_events_past_the_failure() {
    let driver = StubDriver::new()
        .with_element("#s0")
        .with_element("#s1")
        .with_element("#s3")
        .with_element("#s4");
    let (runner, mut rx) = runner_over(driver, None);

    let mut script = Script::new(
        "abort-policy",
        vec![click("#s0"), click("#s1"), click("#missing"), click("#s3"), click("#s4")],
    );
    script.abort_on_error = true;

    let result = runner.run(&script).await;
    assert_eq!(result.status, ScriptStatus::Aborted);
    assert_eq!(result.step_results.len(), 3);
    assert_eq!(
        result.step_results[2].error.as_ref().unwrap().kind,
        "element_not_found"
    );

    let events = drain(&mut rx);
    let started: Vec<i64> = events
        .iter()
        .filter_map(|event| match event {
            RunnerEvent::StepStart { step_index, .. } => Some(*step_index),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![0, 1, 2], "no step events after the failure");
    assert!(events
        .iter()
        .any(|event| matches!(event, RunnerEvent::ScriptComplete { .. })));
}

#[tokio::test]
async fn escalation_short_circuits_without_vision_calls() {
    let driver = StubDriver::new().with_element("#submit");
    let vision = Arc::new(MockVisionClient::new());
    let (runner, _rx) = runner_over(driver, Some(vision.clone()));

    let chain = vec![
        EscalationMethod::new(MethodSpec::Locator {
            locator: LocatorSpec::selector("#submit"),
        }),
        EscalationMethod::new(MethodSpec::VisionLocate {
            prompt: "the submit button".into(),
            prefer: "selector".into(),
            fallback: "coordinates".into(),
        }),
    ];
    let script = Script::new(
        "short-circuit",
        vec![Step::new(StepKind::Click {
            locator: None,
            escalation: Some(chain),
        })],
    );

    let result = runner.run(&script).await;
    assert_eq!(result.status, ScriptStatus::Completed);
    assert_eq!(result.execution_stats.total_vision_calls, 0);
    assert_eq!(result.execution_stats.total_cost, 0.0);
    assert_eq!(vision.call_count(), 0);

    let escalation = result.step_results[0].escalation.as_ref().unwrap();
    assert_eq!(escalation.level, 0);
    assert_eq!(escalation.cost_estimate, 0.0);
}

#[tokio::test]
async fn pause_holds_the_next_step_until_resume() {
    let driver = StubDriver::new().with_element("#n");
    driver.set_op_delay(Duration::from_millis(15));
    let (runner, mut rx) = runner_over(driver, None);
    let handle = runner.handle();

    let script = Script::new(
        "pause-resume",
        (0..6).map(|_| click("#n")).collect::<Vec<_>>(),
    );

    let watcher = tokio::spawn(async move {
        // Pause while step 2 is in flight: it completes, step 3 must park.
        loop {
            match rx.recv().await {
                Ok(RunnerEvent::StepStart { step_index: 2, .. }) => {
                    handle.pause();
                    break;
                }
                Ok(_) => {}
                Err(_) => return (false, Vec::new()),
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut leaked = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RunnerEvent::StepStart { step_index, .. } = event {
                leaked.push(step_index);
            }
        }
        handle.resume();
        // After resume the remaining steps run in order.
        let mut resumed = Vec::new();
        while resumed.len() < 3 {
            match rx.recv().await {
                Ok(RunnerEvent::StepStart { step_index, .. }) => resumed.push(step_index),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        (leaked.is_empty(), resumed)
    });

    let result = runner.run(&script).await;
    let (no_starts_while_paused, resumed) = watcher.await.unwrap();

    assert!(no_starts_while_paused, "step started while paused");
    assert_eq!(resumed, vec![3, 4, 5]);
    assert_eq!(result.status, ScriptStatus::Completed);
    assert_eq!(result.step_results.len(), 6);
}

#[tokio::test]
async fn session_center_runs_scripts_end_to_end() {
    let dir = tempdir().unwrap();
    let store = Arc::new(ProfileStore::open(dir.path().join("profiles")).unwrap());
    let factory = Arc::new(StubFactory::with(|driver| {
        driver
            .with_element("#login")
            .with_page("https://portal.example", "Portal")
    }));
    let center = SessionCenter::new(
        store,
        Arc::new(ArtifactUploader::disabled()),
        factory,
        None,
        None,
        CenterConfig::default(),
    );

    let entry = center.open(SessionOptions::default()).await.unwrap();
    let mut script = Script::new("end-to-end", vec![click("#login")]);
    script.starting_page = Some("https://portal.example".into());

    let result = center.run_script(&entry, script, None).await.unwrap();
    assert_eq!(result.status, ScriptStatus::Completed);
    assert_eq!(result.step_results.len(), 2);
    assert_eq!(result.step_results[0].step_index, -1);
    assert_eq!(result.session_id, entry.id);
    center.close(&entry.id).await.unwrap();
}
