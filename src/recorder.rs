use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use log::warn;

/// Thin wrapper over the cluster event sink.
///
/// Events are best-effort: publish failures are logged and never surfaced to
/// callers, so a broken event pipeline cannot fail a reconciliation.
pub(crate) struct EventRecorder {
    recorder: Recorder,
}

impl EventRecorder {
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn normal(&self, reference: &ObjectReference, reason: &str, action: &str, note: String) {
        self.publish(EventType::Normal, reference, reason, action, note)
            .await
    }

    pub async fn warning(&self, reference: &ObjectReference, reason: &str, action: &str, note: String) {
        self.publish(EventType::Warning, reference, reason, action, note)
            .await
    }

    async fn publish(
        &self,
        type_: EventType,
        reference: &ObjectReference,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!(
                "failed to record {} event on {}: {}",
                reason,
                reference.name.as_deref().unwrap_or("<unnamed>"),
                e
            );
        }
    }
}
