//! A failed run can be re-driven from its preserved original event payload:
//! fresh run id, `rerun_`-prefixed event id, context rebuilt from the
//! original payload, executed against the unit's current action chain.

use cortex_schemas::{Action, Event, RunStatus, StepStatus};
use cortex_store::Store;
use cortex_testkit::{make_unit, TestRig};
use serde_json::json;

fn summarize_then_send() -> Vec<Action> {
    vec![
        Action::Llm {
            prompt: "summarize".to_string(),
            input: "{{payload.snippet}}".to_string(),
            store_as: Some("summary".to_string()),
        },
        Action::Tool {
            tool: "gmail.send".to_string(),
            args: json!({ "to": "team@example.com", "body": "{{summary}}" }),
            store_as: None,
        },
    ]
}

#[tokio::test]
async fn rerun_recreates_context_from_the_preserved_payload() {
    let rig = TestRig::new();
    let unit = make_unit("u1", "gmail", "email_received", vec![], summarize_then_send());
    rig.store.save_unit(&unit).await.unwrap();

    // First execution fails at the tool step.
    rig.tools.fail_tool("gmail.send");
    let payload = json!({ "from": "boss@example.com", "snippet": "q3 numbers" });
    let event = Event::new(
        "gmail_m7_1",
        "u1",
        "gmail",
        "email_received",
        payload.clone(),
        Some("gmail:m7".to_string()),
    );
    let runs = rig.ingest(event).await.unwrap();
    let failed = &runs[0];
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.step, 1, "failed at the tool step");
    assert!(failed.error.as_deref().unwrap_or("").contains("gmail.send"));

    let steps = rig.store.run_steps(failed.id).await.unwrap();
    assert_eq!(steps[1].status, StepStatus::Failed);

    // Fix the upstream, then re-drive from the original event.
    rig.tools.heal("gmail.send");
    let rerun = rig
        .runtime
        .rerun(failed.id)
        .await
        .unwrap()
        .expect("original payload was preserved");

    assert_ne!(rerun.id, failed.id);
    assert_eq!(rerun.event_id, "rerun_gmail_m7_1");
    assert_eq!(rerun.status, RunStatus::Success);
    assert_eq!(rerun.context["payload"], payload);

    // The original run is untouched.
    let original = rig.store.get_run(failed.id).await.unwrap().unwrap();
    assert_eq!(original.status, RunStatus::Failed);

    // The send finally happened, with the summary resolved.
    let calls = rig.tools.calls_for("gmail.send");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args["body"], rerun.context["summary"]);
}

#[tokio::test]
async fn second_rerun_of_the_same_run_is_refused() {
    let rig = TestRig::new();
    let unit = make_unit("u1", "gmail", "email_received", vec![], summarize_then_send());
    rig.store.save_unit(&unit).await.unwrap();

    let event = Event::new(
        "gmail_m8_1",
        "u1",
        "gmail",
        "email_received",
        json!({ "snippet": "hello" }),
        Some("gmail:m8".to_string()),
    );
    let runs = rig.ingest(event).await.unwrap();
    let original = &runs[0];

    assert!(rig.runtime.rerun(original.id).await.unwrap().is_some());
    let err = rig.runtime.rerun(original.id).await.unwrap_err();
    assert!(
        err.to_string().contains("already exists"),
        "duplicate rerun must be refused: {err}"
    );
}

#[tokio::test]
async fn rerun_without_preserved_payload_returns_none() {
    let rig = TestRig::new();
    let missing = uuid::Uuid::new_v4();
    assert!(rig.runtime.rerun(missing).await.unwrap().is_none());
}
