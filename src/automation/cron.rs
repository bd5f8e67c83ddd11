//! Cron expression validation and per-automation timer tasks.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use cron::Schedule;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Callback invoked with the automation id each time its timer fires.
pub type FireCallback = Arc<dyn Fn(Uuid) -> BoxFuture<'static, ()> + Send + Sync>;

/// Result of [`CronRegistry::schedule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    /// The expression was rejected and nothing is registered for the id.
    Invalid { reason: String },
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parse a standard 5-field cron expression (`min hour dom month dow`).
///
/// Day-of-week numbers follow standard cron: 0-6 from Sunday, with 7 also
/// meaning Sunday.
pub fn parse(expr: &str) -> Result<Schedule, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, hour, day_of_month, month, day_of_week] = &fields[..] else {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    };
    let day_of_week = translate_day_of_week(day_of_week)?;
    // The cron crate wants a leading seconds field.
    Schedule::from_str(&format!("0 {minute} {hour} {day_of_month} {month} {day_of_week}"))
        .map_err(|e| format!("invalid cron: {e}"))
}

/// Rewrite numeric day-of-week items as day names.
///
/// The cron crate numbers days 1-7 from Sunday, so numbers are never passed
/// through. Named items (`MON-FRI`) are left for the crate to parse.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    let mut named = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (range, Some(step)),
                _ => return Err(format!("invalid day-of-week step in '{item}'")),
            },
            None => (item, None),
        };

        if range.chars().all(|c| c.is_ascii_alphabetic() || c == '-') && range != "-" {
            named.push(item.to_string());
            continue;
        }

        let (first, last) = if range == "*" {
            (0, 6)
        } else if let Some((first, last)) = range.split_once('-') {
            (day_number(first, item)?, day_number(last, item)?)
        } else {
            let day = day_number(range, item)?;
            // `n/step` runs from n to the end of the week.
            (day, if step.is_some() { 7 } else { day })
        };
        if first > last {
            return Err(format!("day-of-week range '{item}' runs backwards"));
        }
        for day in (first..=last).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    named.extend(
        WEEKDAYS
            .iter()
            .zip(days)
            .filter(|(_, on)| *on)
            .map(|(name, _)| name.to_string()),
    );
    Ok(named.join(","))
}

fn day_number(value: &str, item: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid day of week '{value}' in '{item}'")),
    }
}

/// True if `expr` is a valid 5-field cron expression.
pub fn validate(expr: &str) -> bool {
    parse(expr).is_ok()
}

/// Next local fire time for `expr`.
pub fn next_fire(expr: &str) -> Result<Option<DateTime<Local>>, String> {
    Ok(parse(expr)?.upcoming(Local).next())
}

/// Owns one timer task per scheduled automation.
#[derive(Default)]
pub struct CronRegistry {
    timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl CronRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register (or replace) the timer for `automation_id`.
    ///
    /// An invalid expression leaves nothing registered for the id, including
    /// any timer it had before.
    pub fn schedule(
        &self,
        automation_id: Uuid,
        expr: &str,
        on_fire: FireCallback,
    ) -> ScheduleOutcome {
        match parse(expr) {
            Ok(schedule) => {
                self.install(automation_id, schedule, on_fire);
                debug!(automation = %automation_id, cron = expr, "Cron timer registered");
                ScheduleOutcome::Scheduled
            }
            Err(reason) => {
                self.unschedule(automation_id);
                warn!(automation = %automation_id, cron = expr, %reason, "Not scheduling automation");
                ScheduleOutcome::Invalid { reason }
            }
        }
    }

    fn install(&self, automation_id: Uuid, schedule: Schedule, on_fire: FireCallback) {
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Local).next() else {
                    debug!(automation = %automation_id, "Cron schedule has no further fire times");
                    break;
                };
                let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                debug!(automation = %automation_id, fire_time = %next, "Cron timer fired");
                // Fire on its own task so a slow trigger never delays the next tick.
                tokio::spawn(on_fire(automation_id));
            }
        });

        if let Some(previous) = self.lock().insert(automation_id, handle) {
            previous.abort();
        }
    }

    /// Stop the timer for `automation_id`, if any.
    pub fn unschedule(&self, automation_id: Uuid) -> bool {
        match self.lock().remove(&automation_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every timer.
    pub fn stop_all(&self) {
        let mut timers = self.lock();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self, automation_id: Uuid) -> bool {
        self.lock().contains_key(&automation_id)
    }

    pub fn scheduled_ids(&self) -> Vec<Uuid> {
        self.lock().keys().copied().collect()
    }
}

impl Drop for CronRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
