//! Recipient resolution from request annotations.

use std::collections::{HashMap, HashSet};

/// Annotation listing services that are notified for every request.
pub const DEFAULT_NOTIFY_ANNOTATION: &str = "teleport.dev/notify-services";

/// Annotation listing on-call responders targeted when the alert is opened.
pub const DEFAULT_RESPONDERS_ANNOTATION: &str = "teleport.dev/schedules";

/// Maps request annotations to the responders an alert should target.
///
/// Exactly two keys are consulted. Values are flattened in key order
/// (notify first) and deduplicated by first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientResolver {
    pub notify_key: String,
    pub responders_key: String,
}

impl Default for RecipientResolver {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_ANNOTATION, DEFAULT_RESPONDERS_ANNOTATION)
    }
}

impl RecipientResolver {
    pub fn new(notify_key: impl Into<String>, responders_key: impl Into<String>) -> Self {
        Self {
            notify_key: notify_key.into(),
            responders_key: responders_key.into(),
        }
    }

    /// Responders for a newly created alert. Missing keys contribute nothing.
    pub fn resolve(&self, annotations: &HashMap<String, Vec<String>>) -> Vec<String> {
        flatten_unique(
            [&self.notify_key, &self.responders_key]
                .into_iter()
                .filter_map(|key| annotations.get(key.as_str())),
        )
    }

    /// On-call schedules named by the responders key. A requester on call
    /// for one of these may be approved automatically.
    pub fn on_call_schedules(&self, annotations: &HashMap<String, Vec<String>>) -> Vec<String> {
        flatten_unique(annotations.get(self.responders_key.as_str()).into_iter())
    }
}

fn flatten_unique<'a>(lists: impl Iterator<Item = &'a Vec<String>>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    for value in lists.flatten() {
        let value = value.trim();
        if !value.is_empty() && seen.insert(value.to_string()) {
            recipients.push(value.to_string());
        }
    }
    recipients
}
