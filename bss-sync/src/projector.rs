//! Projection of the selected records onto the fixed field table.
//!
//! Starts from [`Snapshot::blank`] so an absent record, an empty slot, or an
//! absent optional value all read as `""`. `status_msg` is left empty here;
//! the driver fills it once the cycle outcome is known.

use bss_core::{Esaf, Proposal, Timestamp, User, UserList};

use crate::fields::{record_key, user_key, RecordKind};
use crate::snapshot::Snapshot;

pub const FLAG_ON: &str = "ON";
pub const FLAG_OFF: &str = "OFF";

fn flag(value: bool) -> &'static str {
    if value {
        FLAG_ON
    } else {
        FLAG_OFF
    }
}

/// The snapshot for this pair of selections.
pub fn project(proposal: Option<&Proposal>, esaf: Option<&Esaf>) -> Snapshot {
    let mut snap = Snapshot::blank();
    if let Some(esaf) = esaf {
        project_esaf(&mut snap, esaf);
    }
    if let Some(proposal) = proposal {
        project_proposal(&mut snap, proposal);
    }
    snap
}

fn project_esaf(snap: &mut Snapshot, esaf: &Esaf) {
    let kind = RecordKind::Esaf;
    let mut put = |attr: &str, value: String| snap.set(&record_key(kind, attr), value);
    put("id", esaf.id.to_string());
    put("title", esaf.title.clone());
    put("description", esaf.description.clone());
    put("run", esaf.run.clone());
    put("sector", esaf.sector.0.clone());
    put("status", esaf.status.clone());
    put("start_date", esaf.start.canonical());
    put("end_date", esaf.end.canonical());
    put("raw", esaf.raw.as_str().to_owned());
    project_users(snap, kind, &esaf.users);
}

fn project_proposal(snap: &mut Snapshot, proposal: &Proposal) {
    let kind = RecordKind::Proposal;
    let mut put = |attr: &str, value: String| snap.set(&record_key(kind, attr), value);
    put("id", proposal.id.to_string());
    put("title", proposal.title.clone());
    put("beamline_name", proposal.beamline.clone());
    put("start_date", proposal.start.canonical());
    put("end_date", proposal.end.canonical());
    put(
        "submitted_date",
        proposal.submitted.as_ref().map(Timestamp::canonical).unwrap_or_default(),
    );
    put("mail_in_flag", flag(proposal.mail_in).to_owned());
    put("proprietary_flag", flag(proposal.proprietary).to_owned());
    put("raw", proposal.raw.as_str().to_owned());
    project_users(snap, kind, &proposal.users);
}

/// Aggregates over every user, then one block per occupied slot.
fn project_users(snap: &mut Snapshot, kind: RecordKind, users: &UserList) {
    let joined = |pick: fn(&User) -> &str| -> String {
        users.all().iter().map(pick).collect::<Vec<_>>().join(",")
    };
    snap.set(&record_key(kind, "user_badges"), joined(|u| u.badge.as_str()));
    snap.set(&record_key(kind, "user_last_names"), joined(|u| u.last_name.as_str()));
    snap.set(&record_key(kind, "number_users_in_pvs"), users.in_slots().to_string());
    snap.set(&record_key(kind, "number_users_total"), users.total().to_string());

    for (index, user) in users.slots().enumerate() {
        let Some(user) = user else { break };
        let slot = index + 1;
        for (attr, value) in user_values(kind, user) {
            snap.set(&user_key(kind, slot, attr), value);
        }
    }
}

fn user_values(kind: RecordKind, user: &User) -> Vec<(&'static str, String)> {
    let mut values = vec![
        ("badge_number", user.badge.clone()),
        ("email", user.email.clone()),
        ("first_name", user.first_name.clone()),
        ("last_name", user.last_name.clone()),
    ];
    if kind == RecordKind::Proposal {
        values.extend([
            ("institution", user.institution.clone()),
            ("institution_id", user.institution_id.clone()),
            ("user_id", user.user_id.map(|id| id.to_string()).unwrap_or_default()),
            ("pi_flag", flag(user.is_pi).to_owned()),
        ]);
    }
    values
}
