//! Schedule info, the start/expiration block shared by resource manager and
//! Graph schedules and requests.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ScheduleInfo {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub(crate) start_date_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub(crate) expiration: Option<Expiration>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Expiration {
    #[serde(rename = "type", default)]
    pub(crate) expiration_type: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub(crate) end_date_time: Option<OffsetDateTime>,
}

impl ScheduleInfo {
    /// The end date, if the schedule expires at a fixed time
    pub(crate) fn end(&self) -> Option<OffsetDateTime> {
        self.expiration
            .as_ref()
            .filter(|e| {
                e.expiration_type
                    .as_deref()
                    .map(|t| t.eq_ignore_ascii_case("AfterDateTime"))
                    .unwrap_or(true)
            })
            .and_then(|e| e.end_date_time)
    }
}

/// Which spelling of the expiration types to use
#[derive(Clone, Copy)]
pub(crate) enum Casing {
    /// `AfterDateTime`, for resource manager
    Pascal,
    /// `afterDateTime`, for Graph
    Camel,
}

/// Build the `scheduleInfo` body for a request. A missing start is left for
/// the service to fill in with "now".
pub(crate) fn schedule_info_body(
    start: Option<OffsetDateTime>,
    end: Option<OffsetDateTime>,
    casing: Casing,
) -> Result<Value> {
    let (after_date_time, no_expiration) = match casing {
        Casing::Pascal => ("AfterDateTime", "NoExpiration"),
        Casing::Camel => ("afterDateTime", "noExpiration"),
    };
    let expiration = match end {
        Some(end) => json!({"type": after_date_time, "endDateTime": format_time(end)?}),
        None => json!({"type": no_expiration}),
    };
    let mut info = json!({ "expiration": expiration });
    if let Some(start) = start {
        info["startDateTime"] = Value::from(format_time(start)?);
    }
    Ok(info)
}

pub(crate) fn format_time(t: OffsetDateTime) -> Result<String> {
    t.format(&Rfc3339).context("formatting timestamp")
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn open_ended_schedules_have_no_end() -> Result<()> {
        let body = schedule_info_body(None, None, Casing::Pascal)?;
        assert_eq!(body, json!({"expiration": {"type": "NoExpiration"}}));
        Ok(())
    }

    #[test]
    fn graph_uses_camel_case_types() -> Result<()> {
        let body = schedule_info_body(
            Some(datetime!(2024-01-01 0:00 UTC)),
            Some(datetime!(2024-03-01 0:00 UTC)),
            Casing::Camel,
        )?;
        assert_eq!(
            body,
            json!({
                "startDateTime": "2024-01-01T00:00:00Z",
                "expiration": {"type": "afterDateTime", "endDateTime": "2024-03-01T00:00:00Z"}
            })
        );
        Ok(())
    }

    #[test]
    fn duration_expirations_have_no_fixed_end() {
        let info: ScheduleInfo = serde_json::from_value(json!({
            "startDateTime": "2024-01-01T00:00:00.0000000Z",
            "expiration": {"type": "AfterDuration", "duration": "P30D", "endDateTime": null}
        }))
        .unwrap();
        assert!(info.end().is_none());
        assert_eq!(info.start_date_time, Some(datetime!(2024-01-01 0:00 UTC)));
    }
}
