use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use crate::config::ALERT_CHUNK_MAX_CHARS;

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Chat-transport seam. The engine only ever calls `send`; formatting and
/// chunking live on this side of the boundary. Boxed futures keep the trait
/// object-safe so sinks can be swapped in tests.
pub trait AlertSink: Send + Sync {
    fn send<'a>(&'a self, text: &'a str) -> SendFuture<'a>;
}

/// Split a message into chunks of at most `max_len` characters, preferring
/// line boundaries so multi-line reports stay readable.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let s = text.trim();
    if s.is_empty() {
        return vec![String::new()];
    }
    let max_len = max_len.max(1);

    let mut parts = Vec::new();
    let mut rest: &str = s;
    while !rest.is_empty() {
        let chars: Vec<(usize, char)> = rest.char_indices().take(max_len + 1).collect();
        if chars.len() <= max_len {
            parts.push(rest.to_string());
            break;
        }
        // Byte offset just past the max_len-th char.
        let hard_end = chars[max_len].0;
        let window = &rest[..hard_end];
        let cut = match window.rfind('\n') {
            // A newline too close to the start would produce tiny fragments.
            Some(pos) if pos >= (max_len * 3) / 5 => pos,
            _ => chars[max_len - 1].0 + chars[max_len - 1].1.len_utf8(),
        };
        parts.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }
    parts
}

/// Telegram-style bot transport: POST sendMessage per chunk, one retry on
/// transient failure. Delivery problems are logged and swallowed; alerts
/// are best-effort and never affect monitoring state.
pub struct ChatSink {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl ChatSink {
    pub fn new(client: reqwest::Client, bot_token: String, chat_id: String) -> Self {
        Self {
            client,
            bot_token,
            chat_id,
        }
    }

    async fn send_one(&self, text: &str) -> bool {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = serde_json::json!({ "chat_id": self.chat_id, "text": text });
        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("Alert transport rejected message: HTTP {}", resp.status());
                false
            }
            Err(e) => {
                // Keep the bot token out of logs.
                let msg = e.to_string().replace(&self.bot_token, "<redacted>");
                warn!("Alert transport error: {}", msg);
                false
            }
        }
    }
}

impl AlertSink for ChatSink {
    fn send<'a>(&'a self, text: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            let mut ok_all = true;
            for part in split_message(text, ALERT_CHUNK_MAX_CHARS) {
                let mut ok = self.send_one(&part).await;
                if !ok {
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    ok = self.send_one(&part).await;
                }
                ok_all = ok_all && ok;
            }
            if ok_all {
                info!("Alert delivered ({} chars)", text.len());
            }
            ok_all
        })
    }
}

/// Sink used when alerting is not configured; logs instead of sending.
pub struct LogOnlySink;

impl AlertSink for LogOnlySink {
    fn send<'a>(&'a self, text: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            info!("Alert (transport disabled): {}", text.lines().next().unwrap_or(""));
            true
        })
    }
}
