//! Telegram messenger (feature `messenger-telegram`), §4.I SUPPLEMENT.
//! Grounded on the teacher's `channels::telegram::TelegramChannel` —
//! same allow-listed chat IDs, same exponential-backoff long-poll
//! reconnect (1s → 2s → … → 60s max) — narrowed to the single job this
//! gateway needs a chat transport for: presenting an approval prompt
//! with inline Approve/Deny buttons and reporting back whichever the
//! reviewer tapped.
//!
//! Unknown chat IDs are silently ignored, exactly as in the teacher:
//! the bot must not reveal its existence, or leak the existence of a
//! pending approval, to an untrusted sender.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::payloads::{EditMessageTextSetters, SendMessageSetters};
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, UpdateKind};

use crate::error::GatewayError;

use super::{ApprovalCallback, CallbackAction, CallbackFn, MessengerAdapter};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    /// Only chats in this list may see or resolve approval prompts.
    /// Enforced at config-load time to be non-empty (§4.L).
    pub allowed_chat_ids: Vec<i64>,
}

pub struct TelegramMessenger {
    bot: Bot,
    allowed_chat_ids: Vec<i64>,
    callback: Mutex<Option<CallbackFn>>,
    running: AtomicBool,
}

impl TelegramMessenger {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            bot: Bot::new(config.token),
            allowed_chat_ids: config.allowed_chat_ids,
            callback: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    fn callback(&self) -> Option<CallbackFn> {
        self.callback.lock().expect("telegram messenger callback lock poisoned").clone()
    }

    fn keyboard(request_id: &str) -> InlineKeyboardMarkup {
        InlineKeyboardMarkup::new(vec![vec![
            InlineKeyboardButton::callback("Approve", format!("approve:{request_id}")),
            InlineKeyboardButton::callback("Deny", format!("deny:{request_id}")),
        ]])
    }

}

#[async_trait]
impl MessengerAdapter for TelegramMessenger {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_approval(&self, request_id: &str, signature: &str) -> Result<String, GatewayError> {
        let Some(&chat_id) = self.allowed_chat_ids.first() else {
            return Err(GatewayError::Config("telegram messenger has no allowed_chat_ids configured".into()));
        };
        let text = format!("Approval requested\n\n{signature}\n\nid: {request_id}");
        let message = self
            .bot
            .send_message(ChatId(chat_id), text)
            .reply_markup(Self::keyboard(request_id))
            .await
            .map_err(|e| GatewayError::Execution(format!("telegram send failed: {e}")))?;
        Ok(format!("{}:{}", chat_id, message.id.0))
    }

    async fn update_approval(&self, message_id: &str, outcome: &str) -> Result<(), GatewayError> {
        let Some((chat_id_text, msg_id_text)) = message_id.split_once(':') else {
            return Err(GatewayError::Execution(format!("malformed telegram message id: {message_id}")));
        };
        let chat_id: i64 = chat_id_text
            .parse()
            .map_err(|_| GatewayError::Execution(format!("malformed telegram chat id: {chat_id_text}")))?;
        let msg_id: i32 = msg_id_text
            .parse()
            .map_err(|_| GatewayError::Execution(format!("malformed telegram message id: {msg_id_text}")))?;

        self.bot
            .edit_message_text(ChatId(chat_id), MessageId(msg_id), format!("Resolved: {outcome}"))
            .await
            .map_err(|e| GatewayError::Execution(format!("telegram edit failed: {e}")))?;
        Ok(())
    }

    fn set_callback(&self, callback: CallbackFn) {
        *self.callback.lock().expect("telegram messenger callback lock poisoned") = Some(callback);
    }

    async fn start(&self) -> Result<(), GatewayError> {
        self.running.store(true, Ordering::SeqCst);
        // teloxide's polling loop is driven entirely by `self`'s borrowed
        // state, so we cannot spawn a 'static task without cloning the
        // bot and allow-list; both are cheap (Bot is an Arc internally).
        let bot = self.bot.clone();
        let allowed_chat_ids = self.allowed_chat_ids.clone();
        let callback = self.callback();

        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            let mut offset: i32 = 0;
            loop {
                let updates = bot.get_updates().offset(offset).timeout(30).await;
                match updates {
                    Ok(batch) => {
                        backoff = INITIAL_BACKOFF;
                        for update in batch {
                            offset = update.id.0 as i32 + 1;
                            if let UpdateKind::CallbackQuery(query) = update.kind {
                                let Some(data) = query.data.as_deref() else { continue };
                                let Some(chat) = query.message.as_ref().map(|m| m.chat().id) else { continue };
                                if !allowed_chat_ids.contains(&chat.0) {
                                    continue;
                                }
                                let Some((verb, request_id)) = data.split_once(':') else { continue };
                                let action = match verb {
                                    "approve" => CallbackAction::Approve,
                                    "deny" => CallbackAction::Deny,
                                    _ => continue,
                                };
                                let actor = query
                                    .from
                                    .username
                                    .clone()
                                    .unwrap_or_else(|| query.from.id.to_string());
                                if let Some(ref cb) = callback {
                                    cb(ApprovalCallback { request_id: request_id.to_string(), action, actor });
                                }
                                let _ = bot.answer_callback_query(query.id).await;
                            }
                        }
                    }
                    Err(_) => {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn health_check(&self) -> bool {
        self.bot.get_me().await.is_ok()
    }
}
