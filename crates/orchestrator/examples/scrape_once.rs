//! Single scraping task end to end: resolve, launch with fallback,
//! extract the page title, and report the classified outcome.

use std::sync::Arc;

use async_trait::async_trait;
use orchestrator::{
    Orchestrator, OrchestratorConfig, Session, SessionProfile, SessionTask, TaskOutcome,
};

struct TitleTask {
    url: String,
}

#[async_trait]
impl SessionTask for TitleTask {
    async fn run(
        &self,
        session: Arc<Session>,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> {
        session.navigate(&self.url).await?;
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        let title = session.extract("title", "document.title").await?;
        Ok(serde_json::json!({ "url": self.url, "title": title }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = OrchestratorConfig::from_env();
    let orchestrator = Orchestrator::bootstrap(config).await?;
    println!(
        "resolved pair: browser {} / driver {}",
        orchestrator.target().binary_version,
        orchestrator.target().driver_version
    );

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://example.com".to_string());

    let outcome = orchestrator
        .run_task(&SessionProfile::randomized(), &TitleTask { url })
        .await;

    match outcome {
        TaskOutcome::Success { value, .. } => {
            println!("extracted: {value}");
        }
        TaskOutcome::Failure {
            kind,
            attempts,
            artifacts,
            ..
        } => {
            println!("failed: {kind} after {} launch attempts", attempts.len());
            for artifact in artifacts {
                println!("  diagnostic: {}", artifact.path.display());
            }
        }
    }

    Ok(())
}
