//! One-line event rendering for the `mg` viewers

use colored::Colorize;

use crate::events::{Event, EventKind};

/// How a line should be highlighted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Good,
    Bad,
    Neutral,
}

/// Classify an event for colouring
pub fn tone(event: &Event) -> Tone {
    match &event.kind {
        EventKind::TaskCompleted(_) | EventKind::OrchestratorCompleted(_) => Tone::Good,
        EventKind::TaskFailed(_) | EventKind::OrchestratorFailed(_) => Tone::Bad,
        EventKind::AdapterValidation(e) if !e.valid => Tone::Bad,
        EventKind::AdapterPromptLoad(e) if !e.success => Tone::Bad,
        EventKind::AdapterExecution(e) if !e.success && !e.error.is_empty() => Tone::Bad,
        _ => Tone::Neutral,
    }
}

/// Short human-readable description of the payload
pub fn summary(event: &Event) -> String {
    match &event.kind {
        EventKind::TaskStarted(e) => format!("timeout={:?} retry={}", e.timeout, e.retry_count),
        EventKind::TaskProgress(e) => format!("[{}] {:>3.0}% {}", e.stage, e.progress * 100.0, e.message),
        EventKind::TaskCompleted(e) => {
            format!("{} bytes in {:?} model={}", e.output_length, e.duration, e.model)
        }
        EventKind::TaskFailed(e) => format!("{} failed after {:?}: {}", e.stage, e.duration, e.error),
        EventKind::OrchestratorStarted(e) => {
            format!("{} tasks, mode={} concurrency={}", e.task_count, e.mode, e.max_concurrency)
        }
        EventKind::OrchestratorCompleted(e) => format!(
            "{} ok, {} failed of {} in {:?}",
            e.success_count, e.failure_count, e.task_count, e.duration
        ),
        EventKind::OrchestratorFailed(e) => format!(
            "{}: {}/{} finished in {:?}",
            e.error, e.completed_count, e.task_count, e.duration
        ),
        EventKind::AdapterValidation(e) if e.valid => "valid".to_string(),
        EventKind::AdapterValidation(e) => format!("invalid: {}", e.error),
        EventKind::AdapterPromptLoad(e) if e.success => format!("{} chars", e.prompt_length),
        EventKind::AdapterPromptLoad(e) => format!("failed: {}", e.error),
        EventKind::AdapterExecution(e) => {
            let mut line = format!("phase={}", e.phase);
            if !e.model.is_empty() {
                line.push_str(&format!(" model={}", e.model));
            }
            if !e.error.is_empty() {
                line.push_str(&format!(" error={}", e.error));
            }
            line
        }
        EventKind::Generic(e) => e.data.to_string(),
    }
}

/// Full coloured line: time, type, task, agent, summary
pub fn line(event: &Event) -> String {
    let event_type = match tone(event) {
        Tone::Good => event.type_name().green(),
        Tone::Bad => event.type_name().red(),
        Tone::Neutral => event.type_name().cyan(),
    };
    let task = if event.task_id.is_empty() { "-" } else { &event.task_id };
    format!(
        "{} {:<22} {} {} {}",
        event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
        event_type,
        task.bold(),
        event.agent_type().unwrap_or("-").yellow(),
        summary(event)
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::events::{GenericEvent, OrchestratorCompleted, TaskFailed, TaskProgress};

    #[test]
    fn test_tone() {
        let failed = Event::new("t", EventKind::TaskFailed(TaskFailed::default()));
        let done = Event::new("", EventKind::OrchestratorCompleted(OrchestratorCompleted::default()));
        let progress = Event::new("t", EventKind::TaskProgress(TaskProgress::default()));
        assert_eq!(tone(&failed), Tone::Bad);
        assert_eq!(tone(&done), Tone::Good);
        assert_eq!(tone(&progress), Tone::Neutral);
    }

    #[test]
    fn test_summary() {
        let progress = Event::new(
            "t",
            EventKind::TaskProgress(TaskProgress {
                stage: "execution".to_string(),
                message: "halfway".to_string(),
                progress: 0.5,
                ..Default::default()
            }),
        );
        assert_eq!(summary(&progress), "[execution]  50% halfway");

        let failed = Event::new(
            "t",
            EventKind::TaskFailed(TaskFailed {
                error: "boom".to_string(),
                stage: "timeout".to_string(),
                duration: Duration::from_secs(2),
                ..Default::default()
            }),
        );
        assert_eq!(summary(&failed), "timeout failed after 2s: boom");

        let generic = Event::new(
            "t",
            EventKind::Generic(GenericEvent {
                event_type: "custom".to_string(),
                data: json!({"k": 1}),
            }),
        );
        assert_eq!(summary(&generic), r#"{"k":1}"#);
    }

    #[test]
    fn test_line_contains_fields() {
        colored::control::set_override(false);
        let event = Event::new("task_1_abc", EventKind::TaskFailed(TaskFailed::default()));
        let line = line(&event);
        assert!(line.contains("task.failed"));
        assert!(line.contains("task_1_abc"));
    }
}
