//! Session derivation from the external talk schedule.
//!
//! The feed is fetched every pass and the session set fully recomputed;
//! nothing is persisted between passes.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use concierge_core::Result;
use concierge_plan::SessionsSpec;
use tracing::debug;

use crate::types::Session;

/// One talk as reported by the external schedule feed.
#[derive(Debug, Clone)]
pub struct Talk {
    /// Stable id within the conference.
    pub id: String,
    /// Talk title.
    pub title: String,
    /// Talk detail URL.
    pub url: String,
    /// Venue name, if assigned.
    pub venue: Option<String>,
    /// Scheduled slot, if assigned.
    pub begin: Option<DateTime<Utc>>,
    /// End of the scheduled slot, if assigned.
    pub end: Option<DateTime<Utc>>,
    /// Whether the talk is confirmed for the programme.
    pub confirmed: bool,
}

/// External schedule feed boundary.
#[async_trait]
pub trait ScheduleFeed: Send + Sync {
    /// All talks of a conference. Unconfirmed and slotless entries may be
    /// included; derivation filters them.
    async fn talks(&self, conference: &str) -> Result<Vec<Talk>>;
}

/// Derive the ordered session set from a talk list.
///
/// Only confirmed talks with a slot count. Ignored ids are dropped, the
/// demo offset is applied, open times and day indices are computed, and the
/// result is sorted by (begin, end, title).
pub fn derive_sessions(spec: &SessionsSpec, talks: Vec<Talk>, now: DateTime<Utc>) -> Vec<Session> {
    let offset = demo_offset(spec, now);
    let open_early = Duration::minutes(spec.open_early_minutes);

    let mut sessions: Vec<Session> = talks
        .into_iter()
        .filter(|talk| talk.confirmed && !spec.ignore.contains(&talk.id))
        .filter_map(|talk| {
            let begin = talk.begin? + offset;
            let end = talk.end? + offset;
            Some(Session {
                id: talk.id,
                title: talk.title,
                url: talk.url,
                venue: talk.venue,
                begin,
                end,
                open: begin - open_early,
                day: 0,
            })
        })
        .collect();

    sessions.sort_by(|a, b| {
        a.begin
            .cmp(&b.begin)
            .then(a.end.cmp(&b.end))
            .then(a.title.cmp(&b.title))
    });

    if let Some(first) = sessions.first() {
        let first_day = first.begin.date_naive();
        for session in &mut sessions {
            session.day = (session.begin.date_naive() - first_day).num_days();
        }
    }
    debug!(sessions = sessions.len(), "derived session set");
    sessions
}

/// The uniform time shift that lines the configured demo date up with
/// today. Zero when no demo date is configured.
fn demo_offset(spec: &SessionsSpec, now: DateTime<Utc>) -> Duration {
    match spec.demo_date {
        Some(demo_date) => now.date_naive() - demo_date,
        None => Duration::zero(),
    }
}

/// The local room name a session is hosted under.
pub fn session_room_name(spec: &SessionsSpec, session: &Session) -> String {
    let suffix = spec
        .overrides
        .get(&session.id)
        .and_then(|o| o.suffix.clone())
        .unwrap_or_else(|| format!("talk-{}", session.id));
    format!("{}-{}", spec.prefix, suffix)
}

/// The stable tag identifying a session room across renames.
pub fn session_tag(session: &Session) -> String {
    format!("talk/{}", session.id)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeZone;
    use concierge_plan::TalkOverride;

    use super::*;

    fn spec() -> SessionsSpec {
        serde_yaml::from_str("conference: rc3\nprefix: talk").unwrap()
    }

    fn talk(id: &str, title: &str, begin_min: i64, end_min: i64) -> Talk {
        let base = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();
        Talk {
            id: id.into(),
            title: title.into(),
            url: format!("https://talks.example.org/{id}"),
            venue: Some("Main stage".into()),
            begin: Some(base + Duration::minutes(begin_min)),
            end: Some(base + Duration::minutes(end_min)),
            confirmed: true,
        }
    }

    #[test]
    fn unconfirmed_and_slotless_talks_are_dropped() {
        let mut unconfirmed = talk("a", "A", 0, 60);
        unconfirmed.confirmed = false;
        let mut slotless = talk("b", "B", 0, 60);
        slotless.begin = None;

        let sessions = derive_sessions(&spec(), vec![unconfirmed, slotless], Utc::now());
        assert!(sessions.is_empty());
    }

    #[test]
    fn ignored_ids_are_dropped() {
        let mut spec = spec();
        spec.ignore.push("a".into());
        let sessions = derive_sessions(&spec, vec![talk("a", "A", 0, 60)], Utc::now());
        assert!(sessions.is_empty());
    }

    #[test]
    fn ties_on_times_sort_by_title() {
        let sessions = derive_sessions(
            &spec(),
            vec![
                talk("z", "Zebras", 0, 60),
                talk("a", "Aardvarks", 0, 60),
                talk("m", "Meerkats", 0, 60),
            ],
            Utc::now(),
        );
        let titles: Vec<&str> = sessions.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, ["Aardvarks", "Meerkats", "Zebras"]);
    }

    #[test]
    fn open_time_precedes_begin_by_lead_time() {
        let sessions = derive_sessions(&spec(), vec![talk("a", "A", 30, 90)], Utc::now());
        assert_eq!(sessions[0].begin - sessions[0].open, Duration::minutes(10));
    }

    #[test]
    fn day_index_counts_from_first_session_date() {
        let sessions = derive_sessions(
            &spec(),
            vec![talk("a", "A", 0, 60), talk("b", "B", 24 * 60 + 120, 24 * 60 + 180)],
            Utc::now(),
        );
        assert_eq!(sessions[0].day, 0);
        assert_eq!(sessions[1].day, 1);
    }

    #[test]
    fn demo_offset_shifts_sessions_to_today() {
        let mut spec = spec();
        spec.demo_date = Some(chrono::NaiveDate::from_ymd_opt(2026, 6, 1).unwrap());
        let now = Utc.with_ymd_and_hms(2026, 8, 15, 12, 0, 0).unwrap();

        let sessions = derive_sessions(&spec, vec![talk("a", "A", 0, 60)], now);
        assert_eq!(sessions[0].begin.date_naive(), now.date_naive());
    }

    #[test]
    fn room_name_uses_override_suffix() {
        let mut spec = spec();
        spec.overrides.insert(
            "a".into(),
            TalkOverride {
                suffix: Some("keynote".into()),
                ..TalkOverride::default()
            },
        );
        let sessions = derive_sessions(
            &spec,
            vec![talk("a", "A", 0, 60), talk("b", "B", 60, 120)],
            Utc::now(),
        );
        assert_eq!(session_room_name(&spec, &sessions[0]), "talk-keynote");
        assert_eq!(session_room_name(&spec, &sessions[1]), "talk-talk-b");
    }
}
