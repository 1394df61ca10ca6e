//! Broker subject naming.
//!
//! Commands travel on `<namespace>.<module>.<component>.<method>.command` and
//! their completion events on the same subject ending in `.event`.

use serde::{Deserialize, Serialize};

/// Whether a subject carries work (command) or its completion (event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Command,
    Event,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Command => "command",
            TopicKind::Event => "event",
        }
    }
}

/// A fully qualified command or event subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub namespace: String,
    pub module: String,
    pub component: String,
    pub method: String,
    pub kind: TopicKind,
}

impl Topic {
    pub fn command(namespace: &str, module: &str, component: &str, method: &str) -> Self {
        Self::new(namespace, module, component, method, TopicKind::Command)
    }

    pub fn event(namespace: &str, module: &str, component: &str, method: &str) -> Self {
        Self::new(namespace, module, component, method, TopicKind::Event)
    }

    fn new(namespace: &str, module: &str, component: &str, method: &str, kind: TopicKind) -> Self {
        Self {
            namespace: namespace.to_string(),
            module: module.to_string(),
            component: component.to_string(),
            method: method.to_string(),
            kind,
        }
    }

    /// Subject matching every completion event in a namespace.
    pub fn event_wildcard(namespace: &str) -> String {
        format!("{namespace}.*.*.*.{}", TopicKind::Event.as_str())
    }

    /// Subject matching everything in a namespace; bound to the broker stream.
    pub fn namespace_wildcard(namespace: &str) -> String {
        format!("{namespace}.>")
    }

    /// Durable consumer name for this topic.
    pub fn durable_name(&self) -> String {
        durable_name(&self.to_string())
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.namespace,
            self.module,
            self.component,
            self.method,
            self.kind.as_str()
        )
    }
}

/// Turns a subject into a broker-legal consumer name.
///
/// Consumer names may not contain `.`, `*`, `>` or whitespace.
pub fn durable_name(subject: &str) -> String {
    subject
        .chars()
        .map(|c| match c {
            '.' | ' ' | '\t' => '_',
            '*' => 'S',
            '>' => 'R',
            c => c,
        })
        .collect()
}

/// NATS-style subject matching: `*` matches one token, a trailing `>`
/// matches one or more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_and_event_subjects() {
        let command = Topic::command("backtest", "engine", "runner", "start");
        assert_eq!(command.to_string(), "backtest.engine.runner.start.command");

        let event = Topic::event("backtest", "engine", "runner", "start");
        assert_eq!(event.to_string(), "backtest.engine.runner.start.event");
    }

    #[test]
    fn test_event_wildcard_matches_only_events() {
        let wildcard = Topic::event_wildcard("orchestration");
        assert_eq!(wildcard, "orchestration.*.*.*.event");
        assert!(subject_matches(&wildcard, "orchestration.finance.quotes.fetch.event"));
        assert!(!subject_matches(&wildcard, "orchestration.finance.quotes.fetch.command"));
        assert!(!subject_matches(&wildcard, "backtest.finance.quotes.fetch.event"));
        assert!(!subject_matches(&wildcard, "orchestration.finance.quotes.event"));
    }

    #[test]
    fn test_full_wildcard() {
        assert!(subject_matches("backtest.>", "backtest.a.b.c.command"));
        assert!(!subject_matches("backtest.>", "backtest"));
        assert!(!subject_matches("backtest.>", "finance.a"));
    }

    #[test]
    fn test_exact_match() {
        assert!(subject_matches("a.b.c", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b"));
        assert!(!subject_matches("a.b", "a.b.c"));
    }

    #[test]
    fn test_durable_name_is_broker_legal() {
        let topic = Topic::command("backtest", "engine", "runner", "start");
        assert_eq!(topic.durable_name(), "backtest_engine_runner_start_command");
        assert_eq!(
            durable_name("orchestration.*.*.*.event"),
            "orchestration_S_S_S_event"
        );
    }
}
