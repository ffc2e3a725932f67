use financial_assistant_orchestrator::{
    audit::SessionArchive,
    config::OrchestratorConfig,
    execution::ToolExecutor,
    gateway::{Scripted, ScriptedGateway},
    models::{ModelResponse, Part, RequestedCall},
    tools::create_default_registry,
    Orchestrator, SessionEvent,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Offline walkthrough of one tool round against a scripted model
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .init();

    info!("Financial Assistant starting (scripted model)");

    let config = OrchestratorConfig {
        streaming: true,
        ..OrchestratorConfig::default()
    };

    // Create components
    let gateway = Arc::new(ScriptedGateway::new(vec![
        Scripted::Stream {
            chunks: vec!["Let me pull your numbers.".to_string()],
            then: ModelResponse::ToolCallsRequested {
                calls: vec![
                    RequestedCall::new("getFinancialSummary", json!({})),
                    RequestedCall::new("getSpendingByCategory", json!({})),
                ],
            },
        },
        Scripted::Stream {
            chunks: vec![
                "Your net worth is ".to_string(),
                "$50,000.00".to_string(),
            ],
            then: ModelResponse::FinalAnswer {
                text: "Your net worth is $50,000.00".to_string(),
            },
        },
    ]));
    let executor = ToolExecutor::new(Arc::new(create_default_registry()?), config.tool_timeout);
    let orchestrator = Orchestrator::new(gateway, executor, Arc::new(SessionArchive::new()), &config);

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::TextDelta { chunk, .. } => print!("{}", chunk),
                SessionEvent::ToolStarted { name } => println!("\n[running {}]", name),
                SessionEvent::StatusChanged(status) => info!(%status, "Status changed"),
                _ => {}
            }
        }
    });

    let result = orchestrator.send_user_message("Summarize my finances").await;

    match result {
        Ok(output) => {
            println!("\n\n=== RUN RESULT ===");
            println!("Session: {}", output.session_id);
            println!("Tool rounds: {}", output.tool_rounds);
            println!("Answer: {}", output.answer);

            println!("\nTranscript:");
            for (i, turn) in orchestrator.transcript().iter().enumerate() {
                let summary: Vec<String> = turn
                    .parts
                    .iter()
                    .map(|part| match part {
                        Part::Text(text) => format!("text({:?})", text),
                        Part::ToolCall(call) => format!("call({} #{})", call.name, call.call_id),
                        Part::ToolResult(result) => {
                            format!("result({} #{}) {}", result.name, result.call_id, result.payload())
                        }
                    })
                    .collect();
                println!("  {}: {} {}", i + 1, turn.role, summary.join(", "));
            }

            drop(orchestrator);
            printer.await.ok();
            Ok(())
        }
        Err(e) => {
            eprintln!("Run failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
