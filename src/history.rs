use std::collections::HashMap;

use crate::model::RawMessage;
use crate::retry::RetryPolicy;
use crate::settings::RateLimits;
use crate::slack::SlackClient;
use crate::{AppError, Result};

/// First request plus three retries of the same page.
pub const HISTORY_MAX_ATTEMPTS: u32 = 4;
pub const THREAD_MAX_ATTEMPTS: u32 = 3;

/// Fetches channel history and thread replies for one channel export.
///
/// Thread replies are cached by `thread_ts`, so a thread is requested at most
/// once however many times it is asked for.
pub struct HistoryFetcher<'a> {
    client: &'a SlackClient,
    limits: &'a RateLimits,
    threads: HashMap<String, Vec<RawMessage>>,
    thread_requests: usize,
}

impl<'a> HistoryFetcher<'a> {
    pub fn new(client: &'a SlackClient, limits: &'a RateLimits) -> Self {
        Self {
            client,
            limits,
            threads: HashMap::new(),
            thread_requests: 0,
        }
    }

    fn history_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(HISTORY_MAX_ATTEMPTS, self.limits.retry_base_delay())
    }

    fn thread_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(THREAD_MAX_ATTEMPTS, self.limits.retry_base_delay())
    }

    /// Every message in the channel at or after `oldest` (unix seconds), across all pages.
    pub async fn fetch_history(&self, channel_id: &str, oldest: Option<i64>) -> Result<Vec<RawMessage>> {
        let oldest_param = oldest.map(|secs| secs.to_string());
        let policy = self.history_policy();
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page_number = 0usize;

        loop {
            if page_number > 0 {
                tokio::time::sleep(self.limits.page_delay()).await;
            }
            page_number += 1;

            let page = policy
                .run("conversations.history", |_| {
                    self.client.conversations_history(
                        channel_id,
                        oldest_param.as_deref(),
                        cursor.as_deref(),
                    )
                })
                .await
                .map_err(|e| match e {
                    AppError::MissingToken | AppError::Auth(_) => e,
                    other => AppError::Fetch(format!(
                        "conversations.history for {} (page {}): {}",
                        channel_id, page_number, other
                    )),
                })?;

            tracing::debug!(
                channel = channel_id,
                page = page_number,
                count = page.messages.len(),
                "fetched history page"
            );

            let next = page.next_cursor().map(str::to_string);
            messages.extend(page.messages);

            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if let Some(oldest) = oldest {
            let bound = oldest as f64;
            messages.retain(|m| m.ts_seconds() >= bound);
        }

        Ok(messages)
    }

    /// Replies to the thread rooted at `thread_ts`, excluding the parent.
    ///
    /// Failures are logged and yield an empty list.
    pub async fn fetch_thread_replies(
        &mut self,
        channel_id: &str,
        thread_ts: &str,
        oldest: Option<i64>,
    ) -> Vec<RawMessage> {
        if let Some(cached) = self.threads.get(thread_ts) {
            return cached.clone();
        }

        let oldest_param = oldest.map(|secs| secs.to_string());
        let policy = self.thread_policy();
        let client = self.client;
        self.thread_requests += 1;

        let replies = match policy
            .run("conversations.replies", |_| {
                client.conversations_replies(channel_id, thread_ts, oldest_param.as_deref())
            })
            .await
        {
            Ok(page) => page
                .messages
                .into_iter()
                .filter(|m| m.ts != thread_ts)
                .collect(),
            Err(e) => {
                tracing::warn!(
                    channel = channel_id,
                    thread_ts,
                    error = %e,
                    "giving up on thread replies"
                );
                Vec::new()
            }
        };

        self.threads.insert(thread_ts.to_string(), replies.clone());
        replies
    }

    pub fn is_cached(&self, thread_ts: &str) -> bool {
        self.threads.contains_key(thread_ts)
    }

    /// Number of thread fetches that went to the network.
    pub fn thread_requests(&self) -> usize {
        self.thread_requests
    }
}
