//! Alarm evaluation.
//!
//! Every tick each alarm definition is re-read from storage, its aggregate is
//! computed over the trailing window, and the resulting health state is
//! compared with the persisted one. Only a change of state is acted on: the
//! new state is written first and then one notification is queued, so a
//! crash between the two can lose a notification but never repeat a
//! transition.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{AlarmDefinition, AlarmState, Notification, Outbox, Store};

// ---

/// Health state for an aggregate value. The lower bound is checked first.
pub fn evaluate_state(def: &AlarmDefinition, value: Option<f64>) -> AlarmState {
    // ---
    match value {
        None => AlarmState::Unknown,
        Some(v) if def.min.is_some_and(|min| v < min) => AlarmState::TooLow,
        Some(v) if def.max.is_some_and(|max| v > max) => AlarmState::TooHigh,
        Some(_) => AlarmState::Healthy,
    }
}

/// Format a window length as `3d 5h 4m 32s`, omitting zero parts.
pub fn format_time_delta(t: Duration) -> String {
    // ---
    let total = t.num_seconds().max(0);
    let (d, h, m, s) = (total / 86_400, total % 86_400 / 3_600, total % 3_600 / 60, total % 60);

    let mut parts = Vec::new();
    if d > 0 {
        parts.push(format!("{d}d"));
    }
    if h > 0 {
        parts.push(format!("{h}h"));
    }
    if m > 0 {
        parts.push(format!("{m}m"));
    }
    if s > 0 || total == 0 {
        parts.push(format!("{s}s"));
    }
    parts.join(" ")
}

/// Two decimals, or `No data`.
pub fn format_value(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{v:.2}"),
        None => "No data".to_string(),
    }
}

/// Evaluates every stored alarm definition and queues transition notices.
#[derive(Debug, Clone)]
pub struct AlarmEvaluator {
    recipients: Vec<String>,
}

impl AlarmEvaluator {
    // ---
    pub fn new(recipients: Vec<String>) -> Self {
        Self { recipients }
    }

    /// Evaluate all alarms as of `now`. Returns the number of transitions.
    ///
    /// Definitions that fail validation are skipped with a warning and keep
    /// their stored state. Any store error aborts the run; transitions
    /// already recorded in this run stay recorded.
    pub async fn run(&self, store: &dyn Store, outbox: &Outbox, now: DateTime<Utc>) -> Result<usize> {
        // ---
        info!("Evaluating alarms");
        let rows = store.load_alarms().await?;
        let feeds = store.sensor_feeds().await?;

        let mut transitions = 0;
        for row in &rows {
            let def = match AlarmDefinition::try_from(row) {
                Ok(def) => def,
                Err(e) => {
                    warn!("Skipping alarm '{}': {:#}", row.id, e);
                    continue;
                }
            };
            let old_state = AlarmState::from_stored(&row.state);

            let Some(start) = now.checked_sub_signed(def.window) else {
                warn!("Skipping alarm '{}': window {} reaches before the calendar", def.id, def.window);
                continue;
            };
            let value = store.aggregate(def.aggregate, def.sensor_id, start, now).await?;
            let state = evaluate_state(&def, value);
            debug!("{} {} {:?}", def.id, state, value);

            if state == old_state {
                continue;
            }

            error!(
                "ALARM {} old_state={} new_state={} now={}",
                def.id,
                old_state,
                state,
                now.to_rfc3339()
            );
            store.update_alarm_state(&def.id, state).await?;
            outbox.push(self.compose(&def, now, old_state, state, value, &feeds));
            transitions += 1;
        }

        info!("Evaluated {} alarms, {} transitions", rows.len(), transitions);
        Ok(transitions)
    }

    fn compose(
        &self,
        def: &AlarmDefinition,
        now: DateTime<Utc>,
        old_state: AlarmState,
        new_state: AlarmState,
        value: Option<f64>,
        feeds: &HashMap<i32, String>,
    ) -> Notification {
        // ---
        let topic = def
            .sensor_id
            .and_then(|id| feeds.get(&id))
            .map(String::as_str)
            .unwrap_or("Unknown");

        let body = format!(
            "The alarm {} has transitioned from {} to {}.\n\n\
             Time:\t\t{}\n\
             Value:\t\t{}\n\
             Topic:\t\t{}\n\
             Aggregate:\t{}\n\
             Window:\t\t{}\n\
             Min Allowed:\t{}\n\
             Max Allowed:\t{}\n",
            def.id,
            old_state,
            new_state,
            now.format("%m/%d/%Y %H:%M:%S UTC"),
            format_value(value),
            topic,
            def.aggregate.as_str(),
            format_time_delta(def.window),
            format_value(def.min),
            format_value(def.max),
        );

        Notification {
            id: Uuid::new_v4(),
            created_at: now,
            subject: format!("{}: {}", new_state, def.message),
            body,
            recipients: self.recipients.clone(),
        }
    }
}
