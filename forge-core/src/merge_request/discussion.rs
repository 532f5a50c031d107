use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{ForgeError, ForgeResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub text: String,
    /// System-generated note rather than a user comment
    pub is_meta: bool,
    pub created: DateTime<Utc>,
}

/// Discussion threads attached to merge requests
#[async_trait]
pub trait Discussion: Send + Sync {
    /// Create a thread and return its id
    async fn open_thread(&self, title: &str) -> ForgeResult<String>;

    async fn add_post(&self, thread_id: &str, text: &str, is_meta: bool) -> ForgeResult<()>;
}

#[derive(Debug, Clone)]
struct Thread {
    title: String,
    posts: Vec<Post>,
}

#[derive(Default)]
pub struct InMemoryDiscussion {
    threads: Mutex<HashMap<String, Thread>>,
}

impl InMemoryDiscussion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(&self, thread_id: &str) -> Option<String> {
        self.threads.lock().get(thread_id).map(|t| t.title.clone())
    }

    pub fn posts(&self, thread_id: &str) -> Vec<Post> {
        self.threads
            .lock()
            .get(thread_id)
            .map(|t| t.posts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Discussion for InMemoryDiscussion {
    async fn open_thread(&self, title: &str) -> ForgeResult<String> {
        let id = Uuid::new_v4().to_string();
        self.threads.lock().insert(
            id.clone(),
            Thread {
                title: title.to_string(),
                posts: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn add_post(&self, thread_id: &str, text: &str, is_meta: bool) -> ForgeResult<()> {
        let mut threads = self.threads.lock();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| ForgeError::not_found("thread", thread_id))?;
        thread.posts.push(Post {
            text: text.to_string(),
            is_meta,
            created: Utc::now(),
        });
        Ok(())
    }
}
