//! Worker-side help requests.
//!
//! A blocked worker broadcasts its questions, then parks on a
//! per-request reply subject until an operator answers, a dismissal
//! arrives, or the deadline passes. Every outcome resolves the request
//! exactly once; `None` means "no usable answer, proceed on your own
//! judgment".

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::protocol::{HelpAnswer, HelpQuestion, HelpRequestMsg, HelpResponded};
use crate::subjects;

/// Answers to one help request, one selection list per question.
pub type Answers = Vec<Vec<String>>;

#[derive(Clone)]
pub struct HelpCoordinator {
    manager: Arc<ConnectionManager>,
    agent_id: String,
}

impl HelpCoordinator {
    pub fn new(manager: Arc<ConnectionManager>, agent_id: impl Into<String>) -> Self {
        Self {
            manager,
            agent_id: agent_id.into(),
        }
    }

    /// Broadcast `questions` and wait up to `timeout` for an answer.
    ///
    /// Returns `Ok(Some(answers))` on a usable reply, `Ok(None)` on
    /// timeout or an error-bearing reply. The reply subscription is
    /// opened before the broadcast so an instant answer cannot be lost,
    /// and is released when this call returns.
    pub async fn ask(
        &self,
        task_id: &str,
        questions: Vec<HelpQuestion>,
        timeout: Duration,
    ) -> Result<Option<Answers>> {
        let conn = self.manager.current()?;
        let request_id = Uuid::new_v4().to_string();
        let mut replies = conn.subscribe(&subjects::help_reply(&request_id)).await?;

        let request = HelpRequestMsg {
            request_id: request_id.clone(),
            agent_id: self.agent_id.clone(),
            task_id: task_id.to_string(),
            questions,
            created_at: Utc::now(),
            timeout_ms: timeout.as_millis() as u64,
        };
        conn.publish(
            subjects::HELP_REQUEST,
            Bytes::from(serde_json::to_vec(&request)?),
        )
        .await?;
        info!(
            target = "agent_fleet::help",
            request_id = %request_id,
            task_id,
            "help requested"
        );

        let reply = tokio::select! {
            msg = replies.next() => msg,
            _ = tokio::time::sleep(timeout) => {
                info!(
                    target = "agent_fleet::help",
                    request_id = %request_id,
                    "help request timed out"
                );
                // Close the request out in the durable record too, so
                // consoles that replay the helpdesk log do not hold the
                // entry open forever. Best effort: the ask itself has
                // already resolved.
                let record = HelpResponded {
                    request_id: request_id.clone(),
                    answered_by: self.agent_id.clone(),
                    answers: Vec::new(),
                    dismissed: false,
                    timed_out: true,
                };
                if let Err(error) = conn
                    .publish_durable(
                        &subjects::helpdesk_responded(&request_id),
                        Bytes::from(serde_json::to_vec(&record)?),
                    )
                    .await
                {
                    warn!(
                        target = "agent_fleet::help",
                        request_id = %request_id,
                        error = %error,
                        "could not record help timeout"
                    );
                }
                return Ok(None);
            }
        };
        let Some(msg) = reply else {
            // Stream closed under us; treat like a timeout.
            return Ok(None);
        };

        let answer: HelpAnswer = match serde_json::from_slice(&msg.payload) {
            Ok(answer) => answer,
            Err(error) => {
                warn!(
                    target = "agent_fleet::help",
                    request_id = %request_id,
                    error = %error,
                    "undecodable help reply, proceeding unassisted"
                );
                return Ok(None);
            }
        };
        if let Some(error) = answer.error {
            debug!(
                target = "agent_fleet::help",
                request_id = %request_id,
                reason = %error,
                "help request resolved without an answer"
            );
            return Ok(None);
        }
        Ok(Some(answer.answers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConnector;
    use crate::connection::{ConnectionManager, RecoveryFn};
    use crate::testing::MemoryBroker;
    use rand::Rng;
    use std::sync::Arc;

    fn noop_recovery() -> Arc<RecoveryFn> {
        Arc::new(|_conn| Box::pin(async { Ok(()) }))
    }

    async fn connected_manager(broker: Arc<MemoryBroker>) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::new(
            broker,
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        manager.connect(noop_recovery());
        manager.wait_connected().await.unwrap();
        manager
    }

    fn question() -> HelpQuestion {
        HelpQuestion {
            header: "Permission".into(),
            prompt: "Allow rm -rf build/?".into(),
            options: vec!["Allow".into(), "Deny".into()],
            multi_select: false,
        }
    }

    /// Operator double: answers every broadcast after `delay`.
    async fn spawn_operator(broker: &MemoryBroker, delay: Duration, answer: Option<Answers>) {
        let conn = broker.connect().await.unwrap();
        let mut sub = conn.subscribe(subjects::HELP_REQUEST).await.unwrap();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let req: HelpRequestMsg = serde_json::from_slice(&msg.payload).unwrap();
                let reply = HelpAnswer {
                    request_id: req.request_id.clone(),
                    answers: answer.clone().unwrap_or_default(),
                    error: answer.is_none().then(|| "dismissed".to_string()),
                    answered_by: Some("operator".into()),
                };
                tokio::time::sleep(delay).await;
                let _ = conn
                    .publish(
                        &subjects::help_reply(&req.request_id),
                        Bytes::from(serde_json::to_vec(&reply).unwrap()),
                    )
                    .await;
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn answer_within_timeout_is_returned() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_operator(&broker, Duration::from_millis(300), Some(vec![vec!["Allow".into()]])).await;
        let help = HelpCoordinator::new(connected_manager(broker).await, "w1");

        let got = help
            .ask("T1", vec![question()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, Some(vec![vec!["Allow".to_string()]]));
    }

    #[tokio::test(start_paused = true)]
    async fn any_delay_inside_the_window_wins() {
        // Reply latency must not matter as long as it beats the clock.
        let mut rng = rand::thread_rng();
        for _ in 0..5 {
            let delay = Duration::from_millis(rng.gen_range(0..900));
            let broker = Arc::new(MemoryBroker::new());
            spawn_operator(&broker, delay, Some(vec![vec!["Deny".into()]])).await;
            let help = HelpCoordinator::new(connected_manager(broker).await, "w1");
            let got = help
                .ask("T1", vec![question()], Duration::from_secs(1))
                .await
                .unwrap();
            assert!(got.is_some(), "lost an answer delayed {delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_to_none() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_operator(&broker, Duration::from_secs(5), Some(vec![vec!["Allow".into()]])).await;
        let help = HelpCoordinator::new(connected_manager(broker).await, "w1");

        let got = help
            .ask("T1", vec![question()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_a_durable_record() {
        let broker = Arc::new(MemoryBroker::new());
        let setup = broker.connect().await.unwrap();
        setup
            .ensure_log(crate::broker::LogConfig {
                name: subjects::HELPDESK_LOG.into(),
                subjects: vec![subjects::helpdesk_log_pattern()],
                max_age: Duration::from_secs(3600),
            })
            .await
            .unwrap();
        let help = HelpCoordinator::new(connected_manager(broker.clone()).await, "w1");

        let got = help
            .ask("T1", vec![question()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, None);
        assert_eq!(broker.log_len(subjects::HELPDESK_LOG), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_reply_resolves_to_none() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_operator(&broker, Duration::from_millis(50), None).await;
        let help = HelpCoordinator::new(connected_manager(broker).await, "w1");

        let got = help
            .ask("T1", vec![question()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_interest_is_released_after_resolution() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_operator(&broker, Duration::from_millis(10), Some(vec![])).await;
        let base = broker.subscription_count();
        let help = HelpCoordinator::new(connected_manager(broker.clone()).await, "w1");
        help.ask("T1", vec![question()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(broker.subscription_count(), base);
    }
}
