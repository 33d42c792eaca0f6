// src/chat.rs
use crate::analytics::Analytics;
use crate::error::ChatError;
use crate::ledger::Ledger;
use crate::market::MarketService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const SYSTEM_INSTRUCTION: &str = "You are a helpful portfolio management assistant. \
You have access to the user's portfolio data and can provide insights about their \
investments, allocation and performance. Be accurate and give actionable answers.";

const APOLOGY: &str =
    "I'm sorry, I encountered an error processing your request. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Conversation history per user. Lives for the whole process; entries go
/// away only on an explicit clear or sign-out.
#[derive(Default)]
pub struct ChatSessions {
    sessions: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl ChatSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<ChatMessage>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn history(&self, user_id: &str) -> Vec<ChatMessage> {
        self.lock().get(user_id).cloned().unwrap_or_default()
    }

    fn record(&self, user_id: &str, turn: [ChatMessage; 2]) -> Vec<ChatMessage> {
        let mut sessions = self.lock();
        let history = sessions.entry(user_id.to_string()).or_default();
        history.extend(turn);
        history.clone()
    }

    /// Returns whether a session existed.
    pub fn clear(&self, user_id: &str) -> bool {
        let removed = self.lock().remove(user_id).is_some();
        if removed {
            info!("Cleared chat history for user {}", user_id);
        }
        removed
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn reply(&self, history: &[ChatMessage], prompt: &str) -> Result<String, ChatError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ChatMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ChatAssistant {
    model: Option<Arc<dyn ChatModel>>,
    sessions: Arc<ChatSessions>,
    ledger: Arc<Ledger>,
    analytics: Arc<Analytics>,
    market: Arc<MarketService>,
}

impl ChatAssistant {
    pub fn new(
        model: Option<Arc<dyn ChatModel>>,
        sessions: Arc<ChatSessions>,
        ledger: Arc<Ledger>,
        analytics: Arc<Analytics>,
        market: Arc<MarketService>,
    ) -> Self {
        ChatAssistant {
            model,
            sessions,
            ledger,
            analytics,
            market,
        }
    }

    pub fn sessions(&self) -> &ChatSessions {
        &self.sessions
    }

    /// Plain-text summary of the user's portfolio handed to the model. Any
    /// section that cannot be loaded is left out.
    pub async fn portfolio_context(&self, user_id: &str) -> String {
        let mut out = String::new();

        match self.analytics.portfolio(user_id).await {
            Ok(details) => {
                let t = &details.summary;
                let _ = writeln!(out, "PORTFOLIO OVERVIEW:");
                let _ = writeln!(out, "- Total Value: ${:.2}", t.total_market_value);
                let _ = writeln!(out, "- Cash Balance: ${:.2}", t.cash_balance);
                let _ = writeln!(out, "- Total Gain/Loss: ${:.2}", t.total_gain_loss);
                let _ = writeln!(out, "- Total Gain/Loss %: {:.2}%", t.total_gain_loss_percent);

                let _ = writeln!(out, "\nCURRENT HOLDINGS:");
                for h in details.holdings.iter().filter(|h| h.symbol != "CASH") {
                    let _ = writeln!(
                        out,
                        "- {}: {} shares @ ${:.2} avg, Current: ${:.2}, Value: ${:.2}, G/L: ${:.2} ({:.2}%)",
                        h.symbol,
                        h.quantity,
                        h.average_cost,
                        h.current_price,
                        h.market_value,
                        h.gain_loss,
                        h.gain_loss_percent
                    );
                }
            }
            Err(e) => warn!("Could not load portfolio for chat context: {}", e),
        }

        match self.ledger.transaction_history(user_id, 5, 0).await {
            Ok(txs) if !txs.is_empty() => {
                let _ = writeln!(out, "\nRECENT TRANSACTIONS:");
                for tx in txs {
                    let _ = writeln!(
                        out,
                        "- {}: {} {} {} @ ${:.2}",
                        tx.transaction_date.format("%Y-%m-%d"),
                        tx.transaction_type,
                        tx.quantity,
                        tx.symbol,
                        tx.price
                    );
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Could not load transactions for chat context: {}", e),
        }

        match self.analytics.allocation(user_id).await {
            Ok(allocation) if !allocation.is_empty() => {
                let _ = writeln!(out, "\nASSET ALLOCATION:");
                for (bucket, share) in allocation {
                    let _ = writeln!(out, "- {}: {:.1}%", bucket, share.percentage);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Could not load allocation for chat context: {}", e),
        }

        match self.market.watchlist(user_id).await {
            Ok(entries) if !entries.is_empty() => {
                let _ = writeln!(out, "\nWATCHLIST:");
                for entry in entries {
                    let _ = writeln!(out, "- {}", entry.symbol);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Could not load watchlist for chat context: {}", e),
        }

        if out.is_empty() {
            "Portfolio data unavailable".to_string()
        } else {
            out
        }
    }

    pub async fn chat(&self, user_id: &str, message: &str) -> Result<ChatReply, ChatError> {
        let model = self.model.as_ref().ok_or(ChatError::NotConfigured)?;
        let context = self.portfolio_context(user_id).await;
        let prompt = format!(
            "SYSTEM INSTRUCTION:\n{}\n\nPORTFOLIO CONTEXT:\n{}\n\nUSER QUESTION: {}",
            SYSTEM_INSTRUCTION, context, message
        );
        let history = self.sessions.history(user_id);

        match model.reply(&history, &prompt).await {
            Ok(response) => {
                let history = self.sessions.record(
                    user_id,
                    [
                        ChatMessage::new(Role::User, message),
                        ChatMessage::new(Role::Model, response.clone()),
                    ],
                );
                Ok(ChatReply {
                    response,
                    timestamp: Utc::now(),
                    user_id: user_id.to_string(),
                    history: Some(history),
                    error: None,
                })
            }
            Err(e) => {
                error!("Error in chat for user {}: {}", user_id, e);
                Ok(ChatReply {
                    response: APOLOGY.to_string(),
                    timestamp: Utc::now(),
                    user_id: user_id.to_string(),
                    history: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EntryMeta;
    use crate::prices::MemoryPriceCache;
    use crate::store::{MemoryStore, WatchlistStore};
    use rust_decimal_macros::dec;

    /// Echoes the prompt length and remembers what it saw.
    #[derive(Default)]
    struct EchoModel {
        prompts: Mutex<Vec<(usize, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl ChatModel for EchoModel {
        async fn reply(&self, history: &[ChatMessage], prompt: &str) -> Result<String, ChatError> {
            if self.fail {
                return Err(ChatError::Model("quota exceeded".into()));
            }
            self.prompts
                .lock()
                .unwrap()
                .push((history.len(), prompt.to_string()));
            Ok(format!("reply #{}", history.len() / 2 + 1))
        }
    }

    async fn assistant(model: Option<Arc<EchoModel>>) -> (Arc<MemoryStore>, ChatAssistant) {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryPriceCache::new());
        let ledger = Arc::new(Ledger::new(store.clone()));
        let analytics = Arc::new(Analytics::new(ledger.clone(), store.clone(), cache.clone()));
        let market = Arc::new(MarketService::new(None, cache, store.clone()));
        ledger
            .apply_deposit("u1", dec!(1000), EntryMeta::default())
            .await
            .unwrap();
        ledger
            .apply_buy("u1", "AAPL", dec!(2), dec!(100), EntryMeta::default())
            .await
            .unwrap();
        let model = model.map(|m| m as Arc<dyn ChatModel>);
        let assistant = ChatAssistant::new(
            model,
            Arc::new(ChatSessions::new()),
            ledger,
            analytics,
            market,
        );
        (store, assistant)
    }

    #[tokio::test]
    async fn context_lists_portfolio_sections() {
        let (store, assistant) = assistant(None).await;
        store.add_to_watchlist("u1", "TSLA").await.unwrap();
        let context = assistant.portfolio_context("u1").await;
        assert!(context.contains("PORTFOLIO OVERVIEW:"));
        assert!(context.contains("- Cash Balance: $800.00"));
        assert!(context.contains("- AAPL: 2 shares @ $100.00 avg"));
        assert!(context.contains("BUY 2 AAPL @ $100.00"));
        assert!(context.contains("- Cash: 100.0%"));
        assert!(context.contains("WATCHLIST:\n- TSLA"));
    }

    #[tokio::test]
    async fn chat_without_model_is_unavailable() {
        let (_, assistant) = assistant(None).await;
        assert!(matches!(
            assistant.chat("u1", "hi").await,
            Err(ChatError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn chat_records_turns_until_cleared() {
        let model = Arc::new(EchoModel::default());
        let (_, assistant) = assistant(Some(model.clone())).await;

        let first = assistant.chat("u1", "How am I doing?").await.unwrap();
        assert_eq!(first.response, "reply #1");
        let second = assistant.chat("u1", "And now?").await.unwrap();
        assert_eq!(second.response, "reply #2");
        let history = second.history.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[3].content, "reply #2");

        let prompts = model.prompts.lock().unwrap().clone();
        assert_eq!(prompts[1].0, 2);
        assert!(prompts[0].1.contains("USER QUESTION: How am I doing?"));

        assert!(assistant.sessions().clear("u1"));
        assert!(assistant.sessions().history("u1").is_empty());
        assert!(!assistant.sessions().clear("u1"));
    }

    #[tokio::test]
    async fn model_failure_apologizes_without_recording() {
        let model = Arc::new(EchoModel {
            fail: true,
            ..Default::default()
        });
        let (_, assistant) = assistant(Some(model)).await;
        let reply = assistant.chat("u1", "hi").await.unwrap();
        assert_eq!(reply.response, APOLOGY);
        assert_eq!(reply.error.as_deref(), Some("Chat model failed: quota exceeded"));
        assert!(reply.history.is_none());
        assert!(assistant.sessions().history("u1").is_empty());
    }
}
