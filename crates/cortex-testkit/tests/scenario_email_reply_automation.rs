//! A new email from the boss triggers a drafted reply: llm step stores the
//! draft in context, tool step sends it with templates resolved against both
//! the event payload and the stored draft.

use cortex_schemas::{Action, CondOp, Condition, Event, RunStatus, StepStatus};
use cortex_store::Store;
use cortex_testkit::{make_unit, TestRig};
use serde_json::json;

const DRAFT: &str = "Shipping on schedule; details in the tracker.";

#[tokio::test]
async fn email_received_drafts_and_sends_a_reply() {
    let rig = TestRig::with_llm_text(DRAFT);

    let unit = make_unit(
        "u1",
        "gmail",
        "email_received",
        vec![Condition {
            field: "from".to_string(),
            op: CondOp::Contains,
            value: json!("boss@example.com"),
        }],
        vec![
            Action::Llm {
                prompt: "draft_reply".to_string(),
                input: "{{payload.snippet}}".to_string(),
                store_as: Some("draft".to_string()),
            },
            Action::Tool {
                tool: "gmail.reply".to_string(),
                args: json!({ "to": "{{payload.from}}", "body": "{{draft}}" }),
                store_as: None,
            },
        ],
    );
    rig.store.save_unit(&unit).await.unwrap();

    let event = Event::new(
        "gmail_m1_1",
        "u1",
        "gmail",
        "email_received",
        json!({ "from": "boss@example.com", "snippet": "status?" }),
        Some("gmail:m1".to_string()),
    );

    let runs = rig.ingest(event).await.unwrap();
    assert_eq!(runs.len(), 1, "exactly one run for the matching unit");

    let run = &runs[0];
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.step, 2);
    assert_eq!(run.context["draft"], DRAFT, "llm output stored under store_as");

    // Both steps audited as success.
    let steps = rig.store.run_steps(run.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    for step in &steps {
        assert_eq!(step.status, StepStatus::Success, "step {}", step.step_index);
    }
    assert_eq!(steps[0].action_type, "llm");
    assert_eq!(steps[1].action_type, "tool");

    // The reply went to the sender with the drafted body.
    let calls = rig.tools.calls_for("gmail.reply");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args["to"], "boss@example.com");
    assert_eq!(calls[0].args["body"], DRAFT);
    assert_eq!(calls[0].user_id, "u1");

    // The llm saw the resolved snippet, not the template.
    let prompts = rig.llm.prompts();
    assert_eq!(prompts[0].0, "draft_reply");
    assert_eq!(prompts[0].1, json!("status?"));
}

#[tokio::test]
async fn non_matching_sender_produces_no_run() {
    let rig = TestRig::new();

    let unit = make_unit(
        "u1",
        "gmail",
        "email_received",
        vec![Condition {
            field: "from".to_string(),
            op: CondOp::Contains,
            value: json!("boss@example.com"),
        }],
        vec![Action::Tool {
            tool: "gmail.reply".to_string(),
            args: json!({}),
            store_as: None,
        }],
    );
    rig.store.save_unit(&unit).await.unwrap();

    let event = Event::new(
        "gmail_m2_1",
        "u1",
        "gmail",
        "email_received",
        json!({ "from": "spam@elsewhere.net", "snippet": "click here" }),
        Some("gmail:m2".to_string()),
    );

    let runs = rig.ingest(event).await.unwrap();
    assert!(runs.is_empty());
    assert!(rig.tools.calls().is_empty());
}
