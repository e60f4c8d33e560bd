//! Telemetry recording.
//!
//! The core records through the `metrics` facade; an exporter (StatsD or
//! otherwise) is wired up by the embedding platform. Gauge names follow the
//! platform convention `sip.contacts.states.<status>`,
//! `sip.registrations.count`, `sip.registrations.state.<label>` and the
//! per-contact RTT timer `sip.contacts.rtt`.

use std::time::Duration;

use crate::status::ContactStatusKind;

fn contact_state_gauge(status: ContactStatusKind) -> metrics::Gauge {
    metrics::gauge!(format!("sip.contacts.states.{}", status.as_str()))
}

/// Move one contact from the `old` to the `new` status gauge.
pub fn contact_status_changed(old: Option<ContactStatusKind>, new: ContactStatusKind) {
    if old == Some(new) {
        return;
    }

    if let Some(old) = old {
        contact_state_gauge(old).decrement(1.0);
    }
    contact_state_gauge(new).increment(1.0);
}

/// Forget a contact entirely.
pub fn contact_status_dropped(last: ContactStatusKind) {
    contact_state_gauge(last).decrement(1.0);
}

/// Record the round trip time of a successful qualify.
pub fn contact_rtt(contact_id: &str, rtt: Duration) {
    metrics::histogram!("sip.contacts.rtt", "contact" => contact_id.to_string())
        .record(rtt.as_secs_f64() * 1_000.0);
}

/// Track the number of configured outbound registrations.
pub fn registration_count(count: usize) {
    metrics::gauge!("sip.registrations.count").set(count as f64);
}

/// Move an outbound registration between external state gauges.
pub fn registration_state_changed(old: Option<&'static str>, new: Option<&'static str>) {
    if old == new {
        return;
    }

    if let Some(old) = old {
        metrics::gauge!(format!("sip.registrations.state.{old}")).decrement(1.0);
    }
    if let Some(new) = new {
        metrics::gauge!(format!("sip.registrations.state.{new}")).increment(1.0);
    }
}
