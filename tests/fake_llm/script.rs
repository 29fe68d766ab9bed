//! Scripted replies for the fake LLM server
//!
//! Build a sequence with `ScriptBuilder`; the server plays it back one
//! reply per request and repeats the final reply once the script runs
//! out.
//!
//! ```ignore
//! let script = ScriptBuilder::new()
//!     .json(200, body)          // first request
//!     .status(500)              // second request
//!     .delay_ms(200)            // ...delayed by 200 ms
//!     .build();
//! ```

use std::collections::VecDeque;
use std::time::Duration;

/// One canned HTTP response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub delay: Option<Duration>,
}

/// The playback sequence handed to the server.
#[derive(Debug, Clone)]
pub struct Script {
    pub(super) replies: VecDeque<Reply>,
}

pub struct ScriptBuilder {
    replies: Vec<Reply>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self {
            replies: Vec::new(),
        }
    }

    /// Append a JSON reply.
    pub fn json(mut self, status: u16, body: serde_json::Value) -> Self {
        self.replies.push(Reply {
            status,
            body: body.to_string(),
            delay: None,
        });
        self
    }

    /// Append an empty-bodied reply with the given status.
    pub fn status(mut self, status: u16) -> Self {
        self.replies.push(Reply {
            status,
            body: "{}".to_string(),
            delay: None,
        });
        self
    }

    /// Delay the most recently appended reply.
    ///
    /// # Panics
    ///
    /// Panics if called before any reply was added.
    pub fn delay_ms(mut self, millis: u64) -> Self {
        self.replies
            .last_mut()
            .expect("add a reply before .delay_ms()")
            .delay = Some(Duration::from_millis(millis));
        self
    }

    pub fn build(self) -> Script {
        Script {
            replies: self.replies.into(),
        }
    }
}
