//! Record model: users, proposals, ESAFs, and the identifiers that scope them.
//!
//! Records are built fresh on every fetch and are immutable afterwards.
//! Nothing here talks to the network or the broadcast layer.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TimestampError;

/// Number of enumerated user slots published per record.
pub const MAX_USERS: usize = 9;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Facility sector, always held in two-digit form (`"09"`, `"32"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorId(pub String);

impl SectorId {
    /// Zero-pads a one-digit sector; anything else is kept as given.
    pub fn normalized(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.len() == 1 && raw.chars().all(|c| c.is_ascii_digit()) {
            Self(format!("0{raw}"))
        } else {
            Self(raw.to_owned())
        }
    }

    /// Sector from the numeric prefix of a beamline name (`"9-ID-B,C"` → `"09"`).
    pub fn from_beamline(beamline: &str) -> Option<Self> {
        let head = beamline.split('-').next()?.trim();
        let number: u32 = head.parse().ok()?;
        Some(Self(format!("{number:02}")))
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for SectorId {
    fn from(s: &str) -> Self {
        Self::normalized(s)
    }
}

/// Beamline name as stored by the scheduling system, e.g. `"32-ID-B,C"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeamlineName(pub String);

impl fmt::Display for BeamlineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for BeamlineName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BeamlineName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Numeric proposal (GUP) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub u64);

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Numeric ESAF identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EsafId(pub u64);

impl fmt::Display for EsafId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a fetch is scoped to. ESAFs are per sector; proposals need a beamline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Station {
    pub sector: SectorId,
    pub beamline: Option<BeamlineName>,
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// An instant with the offset it was reported in.
///
/// Ordering compares instants, so two timestamps written in different
/// offsets compare correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub DateTime<FixedOffset>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Local::now().fixed_offset())
    }

    /// Accepts ISO 8601 with an offset, `YYYY-MM-DD HH:MM:SS[.ffffff][+HH:MM]`
    /// with either separator, or a bare date. Text without an offset is read
    /// in the local time zone.
    pub fn parse(text: &str) -> Result<Self, TimestampError> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(Self(dt));
        }
        for layout in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%:z"] {
            if let Ok(dt) = DateTime::parse_from_str(text, layout) {
                return Ok(Self(dt));
            }
        }
        for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, layout) {
                return Ok(Self::from_local(naive));
            }
        }
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Self::from_local)
            .ok_or_else(|| TimestampError { text: text.to_owned() })
    }

    fn from_local(naive: NaiveDateTime) -> Self {
        // Wall-clock times inside a DST gap have no local instant; read them as UTC.
        let dt = Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.fixed_offset())
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive).fixed_offset());
        Self(dt)
    }

    /// `YYYY-MM-DD HH:MM:SS` in the offset the timestamp was reported in.
    pub fn canonical(&self) -> String {
        self.0.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// ISO 8601 with offset, whole seconds. The form the scheduling API expects.
    pub fn iso(&self) -> String {
        self.0.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    }

    pub fn year(&self) -> i32 {
        use chrono::Datelike;
        self.0.year()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl std::str::FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// One experimenter listed on a proposal or ESAF.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub badge: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub institution: String,
    pub institution_id: String,
    pub is_pi: bool,
    pub user_id: Option<u64>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Upstream PI tokens are free text; only the first letter counts.
    pub fn parse_pi_flag(token: &str) -> bool {
        matches!(token.trim().chars().next(), Some('y' | 'Y'))
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.full_name(), self.email)
    }
}

/// All users of a record, in upstream order.
///
/// Every user is kept so aggregates can count them; only the first
/// [`MAX_USERS`] are addressable as slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserList(Vec<User>);

impl UserList {
    pub fn new(users: Vec<User>) -> Self {
        Self(users)
    }

    pub fn all(&self) -> &[User] {
        &self.0
    }

    pub fn total(&self) -> usize {
        self.0.len()
    }

    /// Number of users that occupy a slot.
    pub fn in_slots(&self) -> usize {
        self.0.len().min(MAX_USERS)
    }

    /// Exactly [`MAX_USERS`] entries; trailing slots are `None`.
    pub fn slots(&self) -> impl Iterator<Item = Option<&User>> + '_ {
        (0..MAX_USERS).map(move |i| self.0.get(i))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<User>> for UserList {
    fn from(users: Vec<User>) -> Self {
        Self(users)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The upstream document as serialized once at fetch time. Never re-parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawText(Arc<str>);

impl RawText {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RawText {
    fn default() -> Self {
        Self(Arc::from(""))
    }
}

/// Upstream yes/no tokens for mail-in and proprietary flags.
pub fn parse_yes_flag(token: &str) -> bool {
    matches!(token, "Y" | "y")
}

/// A scheduled beamtime allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub id: ProposalId,
    pub title: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub submitted: Option<Timestamp>,
    pub beamline: String,
    pub mail_in: bool,
    pub proprietary: bool,
    pub users: UserList,
    pub raw: RawText,
}

impl Proposal {
    /// First user flagged as PI, else the first user listed.
    pub fn pi(&self) -> Option<&User> {
        let users = self.users.all();
        users.iter().find(|u| u.is_pi).or_else(|| users.first())
    }
}

/// A scheduling period (`2020-2`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub name: String,
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Run {
    /// Calendar year from the run name, which the ESAF service is indexed by.
    pub fn year(&self) -> Option<i32> {
        self.name.split('-').next()?.trim().parse().ok()
    }

    pub fn covers(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }
}

/// An Experiment Safety Approval Form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Esaf {
    pub id: EsafId,
    pub title: String,
    pub description: String,
    pub run: String,
    pub sector: SectorId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub status: String,
    pub users: UserList,
    pub raw: RawText,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn user(first: &str, last: &str, pi: bool) -> User {
        User {
            first_name: first.into(),
            last_name: last.into(),
            email: format!("{}@example.org", first.to_lowercase()),
            is_pi: pi,
            ..User::default()
        }
    }

    fn proposal(users: Vec<User>) -> Proposal {
        Proposal {
            id: ProposalId(66083),
            title: "Chemical heterogeneity".into(),
            start: Timestamp::parse("2020-06-01 08:00:00").unwrap(),
            end: Timestamp::parse("2020-06-05 08:00:00").unwrap(),
            submitted: None,
            beamline: "9-ID-B,C".into(),
            mail_in: false,
            proprietary: false,
            users: UserList::new(users),
            raw: RawText::default(),
        }
    }

    #[rstest]
    #[case("9", "09")]
    #[case("09", "09")]
    #[case("32", "32")]
    #[case(" 2 ", "02")]
    fn sector_is_zero_padded(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(SectorId::normalized(raw).0, expected);
    }

    #[rstest]
    #[case("9-ID-B,C", Some("09"))]
    #[case("32-ID-B,C", Some("32"))]
    #[case("BM", None)]
    fn sector_from_beamline(#[case] beamline: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            SectorId::from_beamline(beamline).map(|s| s.0),
            expected.map(String::from)
        );
    }

    #[rstest]
    #[case("2020-05-26 08:00:00", "2020-05-26 08:00:00")]
    #[case("2020-05-26 08:00:00.123456", "2020-05-26 08:00:00")]
    #[case("2020-05-26T08:00:00-05:00", "2020-05-26 08:00:00")]
    #[case("2020-05-26 08:00:00-05:00", "2020-05-26 08:00:00")]
    #[case("2020-05-26", "2020-05-26 00:00:00")]
    fn timestamp_canonical_form(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(Timestamp::parse(text).unwrap().canonical(), expected);
    }

    #[test]
    fn timestamp_rejects_garbage() {
        let err = Timestamp::parse("next tuesday").unwrap_err();
        assert_eq!(err.text, "next tuesday");
    }

    #[test]
    fn timestamp_orders_by_instant() {
        let a = Timestamp::parse("2020-05-26T08:00:00-05:00").unwrap();
        let b = Timestamp::parse("2020-05-26T14:00:00+00:00").unwrap();
        assert!(a < b);
    }

    #[rstest]
    #[case("Y", true)]
    #[case("yes", true)]
    #[case("y", true)]
    #[case("N", false)]
    #[case("", false)]
    fn pi_flag_uses_first_letter(#[case] token: &str, #[case] expected: bool) {
        assert_eq!(User::parse_pi_flag(token), expected);
    }

    #[rstest]
    #[case("Y", true)]
    #[case("y", true)]
    #[case("yes", false)]
    #[case("N", false)]
    fn yes_flag_is_single_letter(#[case] token: &str, #[case] expected: bool) {
        assert_eq!(parse_yes_flag(token), expected);
    }

    #[test]
    fn user_display_includes_email() {
        let u = user("Ada", "Lovelace", false);
        assert_eq!(u.to_string(), "Ada Lovelace <ada@example.org>");
    }

    #[test]
    fn pi_prefers_flagged_user() {
        let p = proposal(vec![user("A", "One", false), user("B", "Two", true)]);
        assert_eq!(p.pi().unwrap().last_name, "Two");
    }

    #[test]
    fn pi_falls_back_to_first_user() {
        let p = proposal(vec![user("A", "One", false), user("B", "Two", false)]);
        assert_eq!(p.pi().unwrap().last_name, "One");
        assert!(proposal(vec![]).pi().is_none());
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(9)]
    #[case(12)]
    fn slots_are_always_max_users(#[case] n: usize) {
        let users: Vec<User> = (0..n).map(|i| user("U", &i.to_string(), false)).collect();
        let list = UserList::new(users);
        assert_eq!(list.slots().count(), MAX_USERS);
        assert_eq!(list.slots().filter(Option::is_some).count(), n.min(MAX_USERS));
        assert_eq!(list.total(), n);
        assert_eq!(list.in_slots(), n.min(MAX_USERS));
    }

    fn run(name: &str) -> Run {
        Run {
            name: name.into(),
            start: Timestamp::parse("2020-06-09 08:00:00").unwrap(),
            end: Timestamp::parse("2020-10-01 08:00:00").unwrap(),
        }
    }

    #[rstest]
    #[case("2020-2", Some(2020))]
    #[case("2024-1", Some(2024))]
    #[case("next", None)]
    fn run_year_comes_from_the_name(#[case] name: &str, #[case] expected: Option<i32>) {
        assert_eq!(run(name).year(), expected);
    }

    #[test]
    fn run_window_is_inclusive() {
        let r = run("2020-2");
        assert!(r.covers(r.start));
        assert!(r.covers(r.end));
        assert!(!r.covers(Timestamp::parse("2020-10-01 08:00:01").unwrap()));
    }
}
