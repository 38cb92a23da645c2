// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end batch tests against in-process and webhook agents.

use agentsim_core::{
    AgentOutput, KnowledgeBaseConfig, KnowledgeDocument, PersonaConfig, PersonaTemplate,
    RunStatus, SimulationConfig, TerminationReason, TestCase, WebhookTargetConfig,
};
use agentsim_engine::{
    parse_evaluation_json, AgentError, AgentFactory, AgentInput, ExportFormat, Exporter, FnAgent,
    SimulationBatchRunner, TargetAgent, WebhookAgent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn replying(text: &'static str) -> AgentFactory {
    Arc::new(move || -> Arc<dyn TargetAgent> {
        FnAgent::shared(move |_input| async move { Ok::<_, AgentError>(AgentOutput::text(text)) })
    })
}

fn config(num_simulations: usize, max_turns: usize) -> SimulationConfig {
    SimulationConfig {
        num_simulations,
        max_turns,
        ..Default::default()
    }
}

#[tokio::test]
async fn three_ok_runs_with_two_turns_each() {
    let results = SimulationBatchRunner::new(config(3, 2), replying("OK"))
        .run()
        .await
        .unwrap();

    assert_eq!(results.runs.len(), 3);
    for run in &results.runs {
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.turns.len(), 2);
        let indices: Vec<_> = run.turns.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }
    assert!(!results.cancelled);
    assert_eq!(results.summary.completed, 3);
}

#[tokio::test]
async fn one_failing_agent_does_not_stop_siblings() {
    let factory: AgentFactory = Arc::new(|| -> Arc<dyn TargetAgent> {
        FnAgent::shared(|input: AgentInput| async move {
            if input.context.get("user_id") == Some(&serde_json::json!("persona-3")) {
                Err(AgentError::NetworkError("connection reset".into()))
            } else {
                Ok(AgentOutput::text("Sure, I can help with that."))
            }
        })
    });

    let results = SimulationBatchRunner::new(config(5, 2), factory)
        .run()
        .await
        .unwrap();

    assert_eq!(results.runs.len(), 5);
    assert_eq!(results.summary.failed, 1);
    assert_eq!(results.summary.completed, 4);
    let failed = &results.runs[2];
    assert_eq!(failed.termination, TerminationReason::AgentError);
    assert!(failed.turns.is_empty());
}

#[tokio::test]
async fn panicking_agent_keeps_turns_before_the_panic() {
    let factory: AgentFactory = Arc::new(|| -> Arc<dyn TargetAgent> {
        FnAgent::shared(|input: AgentInput| async move {
            if input.turn_index == 2 {
                panic!("agent exploded");
            }
            Ok::<_, AgentError>(AgentOutput::text("Let me look into that for you."))
        })
    });

    let results = SimulationBatchRunner::new(config(1, 4), factory)
        .run()
        .await
        .unwrap();

    let run = &results.runs[0];
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.termination, TerminationReason::AgentError);
    assert_eq!(run.turns.len(), 2);
    assert!(run.error.as_deref().unwrap().contains("agent panicked"));
    assert_eq!(results.summary.total_turns, 2);
}

#[tokio::test]
async fn batch_goal_ends_conversation_once_met() {
    let config = SimulationConfig {
        goal: Some("reset password".to_string()),
        test_cases: vec![TestCase::new("tc-1", "I cannot log in")],
        ..config(1, 5)
    };

    let results = SimulationBatchRunner::new(config, replying("I have reset your password now."))
        .run()
        .await
        .unwrap();

    let run = &results.runs[0];
    assert_eq!(run.termination, TerminationReason::GoalSatisfied);
    assert_eq!(run.turns.len(), 1);
}

#[tokio::test]
async fn run_timeout_keeps_completed_turns() {
    let factory: AgentFactory = Arc::new(|| -> Arc<dyn TargetAgent> {
        FnAgent::shared(|input: AgentInput| async move {
            if input.turn_index == 1 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok::<_, AgentError>(AgentOutput::text("Here is the first answer."))
        })
    });
    let config = SimulationConfig {
        run_timeout_secs: 1,
        agent_timeout_secs: 10,
        ..config(1, 3)
    };

    let results = SimulationBatchRunner::new(config, factory).run().await.unwrap();

    let run = &results.runs[0];
    assert_eq!(run.status, RunStatus::TimedOut);
    assert_eq!(run.turns.len(), 1);
    assert_eq!(results.summary.timed_out, 1);
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_in_flight_runs() {
    let factory: AgentFactory = Arc::new(|| -> Arc<dyn TargetAgent> {
        FnAgent::shared(|_input| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, AgentError>(AgentOutput::text("too late"))
        })
    });
    let config = SimulationConfig {
        max_concurrency: 2,
        ..config(10, 2)
    };
    let cancel = CancellationToken::new();
    let runner = SimulationBatchRunner::new(config, factory).with_cancellation(cancel.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let results = runner.run().await.unwrap();
    trigger.await.unwrap();

    assert!(results.cancelled);
    assert_eq!(results.requested, 10);
    assert_eq!(results.runs.len(), 2);
    assert!(results.runs.iter().all(|r| r.status == RunStatus::Cancelled));
}

#[tokio::test]
async fn long_responses_violate_word_limit_and_survive_export() {
    let config = SimulationConfig {
        rules: vec!["Must not exceed 10 words".to_string()],
        ..config(2, 2)
    };
    let factory = replying(
        "Thank you for reaching out today, I will look into your account details right now.",
    );

    let results = SimulationBatchRunner::new(config, factory).run().await.unwrap();

    assert_eq!(results.violation_count(), 4);
    assert_eq!(results.summary.violation_counts["rule-1"], 4);
    assert_eq!(results.summary.pass_rate, 0.0);
    let verdict = &results.runs[0].turns[1].verdicts[0];
    assert!(verdict.violated);
    assert_eq!(verdict.scope.turn_index(), Some(1));

    let body = Exporter::new()
        .export(&results, ExportFormat::EvaluationJson)
        .unwrap();
    let parsed = parse_evaluation_json(&body).unwrap();
    assert_eq!(parsed.run_count(), results.run_count());
    assert_eq!(parsed.turn_count(), results.turn_count());
    assert_eq!(parsed.violation_count(), results.violation_count());

    let rlhf = Exporter::new().export(&results, ExportFormat::Rlhf).unwrap();
    assert_eq!(rlhf.lines().count(), 2);
    assert!(rlhf.contains("\"label\":\"negative\""));
}

#[tokio::test]
async fn csv_personas_are_assigned_sequentially() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.csv");
    std::fs::write(&path, "user_id,plan\n1,gold\n2,basic\n3,gold\n4,basic\n5,gold\n").unwrap();

    let config = SimulationConfig {
        persona: PersonaConfig {
            template: PersonaTemplate::Csv {
                path,
                id_column: "user_id".to_string(),
            },
            ..Default::default()
        },
        ..config(7, 1)
    };

    let results = SimulationBatchRunner::new(config, replying("OK"))
        .run()
        .await
        .unwrap();

    let ids: Vec<_> = results
        .runs
        .iter()
        .map(|r| r.persona.user_id.as_str())
        .collect();
    assert_eq!(ids, vec!["1", "2", "3", "4", "5", "1", "2"]);
    assert_eq!(results.runs[1].persona.attributes["plan"], "basic");
}

#[tokio::test]
async fn csv_without_id_column_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.csv");
    std::fs::write(&path, "name,plan\nada,gold\n").unwrap();

    let config = SimulationConfig {
        persona: PersonaConfig {
            template: PersonaTemplate::Csv {
                path,
                id_column: "user_id".to_string(),
            },
            ..Default::default()
        },
        ..config(1, 1)
    };

    let err = SimulationBatchRunner::new(config, replying("OK"))
        .run()
        .await
        .unwrap_err();
    assert!(err.is_batch_fatal());
}

#[tokio::test]
async fn claims_require_a_knowledge_base() {
    let factory = replying("Refunds are processed within 14 business days.");

    let without = SimulationBatchRunner::new(config(2, 1), factory.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(without.summary.total_claims, 0);

    let config = SimulationConfig {
        knowledge_base: Some(KnowledgeBaseConfig {
            documents: vec![KnowledgeDocument {
                id: "refund-policy".to_string(),
                text: "Refunds are processed within 14 business days of the return.".to_string(),
            }],
            paths: Vec::new(),
        }),
        ..config(2, 1)
    };
    let with = SimulationBatchRunner::new(config, factory).run().await.unwrap();

    assert_eq!(with.summary.total_claims, 2);
    assert_eq!(with.summary.flagged_claims, 0);
    let claim = &with.runs[0].turns[0].claims[0];
    assert_eq!(claim.sources, vec!["refund-policy"]);
    assert!((0.0..=100.0).contains(&claim.confidence));
}

#[tokio::test]
async fn webhook_target_single_turn() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/support-flow")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"response": "Your order ships tomorrow."}"#)
        .expect(2)
        .create_async()
        .await;

    let target = WebhookTargetConfig {
        base_url: server.url(),
        workflow_id: "support-flow".to_string(),
        credential: None,
        payload: serde_json::Map::new(),
    };
    let factory: AgentFactory = Arc::new(move || -> Arc<dyn TargetAgent> {
        match WebhookAgent::from_config(&target) {
            Ok(agent) => Arc::new(agent),
            Err(e) => panic!("webhook agent: {}", e),
        }
    });

    let results = SimulationBatchRunner::new(config(2, 1), factory)
        .run()
        .await
        .unwrap();

    mock.assert_async().await;
    assert!(results.runs.iter().all(|r| r.status == RunStatus::Completed));
    assert_eq!(
        results.runs[0].turns[0].agent_output.text,
        "Your order ships tomorrow."
    );
}
