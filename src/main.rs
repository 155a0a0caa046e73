//! swarmdesk demo deployment.
//!
//! Wires the three core services, brings a front desk and two specialists
//! online, runs a few customer requests and prints the goal report.

use std::sync::Arc;

use swarmdesk::agents::{AgentServices, FrontDeskAgent, SpecialistAgent, BILLING, TECH_SUPPORT};
use swarmdesk::goal::{GoalEvent, GoalStatus, Priority};
use swarmdesk::hub::CommunicationHub;
use swarmdesk::knowledge::KeywordKnowledgeBase;
use swarmdesk::recovery::RecoveryHandler;
use swarmdesk::{Config, GoalManager};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swarmdesk=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let services = AgentServices {
        hub: CommunicationHub::new(config.hub.clone()),
        goals: GoalManager::new(config.goals.clone()),
        recovery: RecoveryHandler::new(config.recovery.clone()),
        knowledge: Arc::new(KeywordKnowledgeBase::with_default_faq()),
    };

    // Escalation sink: in a real deployment this would page an operator.
    let mut events = services.goals.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let GoalEvent::Transitioned { goal_id, to, reason, .. } = event;
            if to == GoalStatus::Escalated {
                warn!(goal_id = %goal_id, reason = ?reason, "Goal escalated to human operator");
            }
        }
    });

    let stop = CancellationToken::new();
    let billing = SpecialistAgent::new(BILLING, services.clone()).await;
    let tech = SpecialistAgent::new(TECH_SUPPORT, services.clone()).await;
    let workers = vec![
        tokio::spawn(billing.run(stop.clone())),
        tokio::spawn(tech.run(stop.clone())),
    ];

    let front_desk = FrontDeskAgent::new(services.clone()).await;
    let queries = [
        ("How do I reset my password?", Priority::Normal),
        ("I want a refund for a duplicate charge", Priority::High),
        ("My smart speaker keeps rebooting", Priority::Normal),
    ];
    for (query, priority) in queries {
        let resolution = front_desk.handle_query(query, priority).await?;
        info!(
            goal_id = %resolution.goal.id(),
            status = %resolution.goal.status(),
            "Customer: {query}"
        );
        info!("Reply: {}", resolution.reply);
    }

    let report = services.goals.get_report().await;
    info!(
        total = report.total,
        completion_rate = report.completion_rate,
        "Goal report: {:?}",
        report.by_status
    );

    stop.cancel();
    for worker in workers {
        worker.await?;
    }
    Ok(())
}
