//! UID/GID reconciliation of the clone user inside a container.
//!
//! Files cloned into the bind-mounted workspace directory must end up owned
//! by the host user (or the remote shell user), so the clone user's entry in
//! the container's `/etc/passwd` and `/etc/group` is rewritten to the host
//! ids before cloning.
//!
//! When another group already owns the new GID the user keeps its old GID
//! while the UID is still updated. This asymmetry is intentional: it keeps
//! ownership of files that already belong to that group inside the image.

use std::fmt;

/// User the clone runs as unless the host ids are root.
pub const CLONE_USER: &str = "ws";

/// Container user for a clone driven by host `uid:gid`.
pub fn clone_user_for(uid: u32, gid: u32) -> &'static str {
    if uid == 0 && gid == 0 {
        "root"
    } else {
        CLONE_USER
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UidGidOutcome {
    UserNotFound { user: String },
    Unchanged { uid: u32, gid: u32 },
    /// Another user already owns the new UID; nothing is changed.
    UidTaken { existing_user: String, uid: u32 },
    Updated {
        old_uid: u32,
        old_gid: u32,
        new_uid: u32,
        new_gid: u32,
        /// Group that already owned the requested GID, if any.
        gid_collision: Option<String>,
    },
}

impl fmt::Display for UidGidOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserNotFound { user } => {
                write!(f, "Remote user not found in /etc/passwd ({}).", user)
            }
            Self::Unchanged { uid, gid } => {
                write!(f, "UIDs and GIDs are the same ({}:{}).", uid, gid)
            }
            Self::UidTaken { existing_user, uid } => {
                write!(f, "User with UID exists ({}={}).", existing_user, uid)
            }
            Self::Updated {
                old_uid,
                old_gid,
                new_uid,
                new_gid,
                gid_collision,
            } => {
                if let Some(group) = gid_collision {
                    writeln!(f, "Group with GID exists ({}), keeping GID {}.", group, old_gid)?;
                }
                write!(
                    f,
                    "Updating UID:GID from {}:{} to {}:{}.",
                    old_uid, old_gid, new_uid, new_gid
                )
            }
        }
    }
}

/// Result of reconciling the user database; rewritten files are set only when they changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidGidPatch {
    pub outcome: UidGidOutcome,
    pub passwd: Option<String>,
    pub group: Option<String>,
    /// Home directory to re-own after an update.
    pub home: Option<String>,
}

struct PasswdEntry<'a> {
    uid: &'a str,
    gid: &'a str,
    home: &'a str,
}

fn fields(line: &str) -> Vec<&str> {
    line.split(':').collect()
}

fn find_user<'a>(passwd: &'a str, user: &str) -> Option<PasswdEntry<'a>> {
    passwd.lines().find_map(|line| {
        let f = fields(line);
        (f.len() >= 6 && f[0] == user).then(|| PasswdEntry {
            uid: f[2],
            gid: f[3],
            home: f[5],
        })
    })
}

/// Name on the last line whose third field equals `id`.
fn owner_of_id<'a>(db: &'a str, id: &str) -> Option<&'a str> {
    db.lines()
        .filter_map(|line| {
            let f = fields(line);
            (f.len() >= 3 && f[2] == id).then_some(f[0])
        })
        .last()
}

fn rewrite_lines(db: &str, mut rewrite: impl FnMut(&str) -> Option<String>) -> String {
    let mut out: String = db
        .lines()
        .map(|line| rewrite(line).unwrap_or_else(|| line.to_string()))
        .collect::<Vec<_>>()
        .join("\n");
    if db.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn parse_id(raw: &str) -> u32 {
    raw.trim().parse().unwrap_or(u32::MAX)
}

/// Rewrite `user`'s UID/GID in the given `/etc/passwd` and `/etc/group` contents.
pub fn reconcile(passwd: &str, group: &str, user: &str, new_uid: u32, new_gid: u32) -> UidGidPatch {
    let unchanged = |outcome| UidGidPatch {
        outcome,
        passwd: None,
        group: None,
        home: None,
    };

    let Some(entry) = find_user(passwd, user) else {
        return unchanged(UidGidOutcome::UserNotFound {
            user: user.to_string(),
        });
    };
    let (new_uid_s, new_gid_s) = (new_uid.to_string(), new_gid.to_string());

    if entry.uid == new_uid_s && entry.gid == new_gid_s {
        return unchanged(UidGidOutcome::Unchanged {
            uid: new_uid,
            gid: new_gid,
        });
    }
    if entry.uid != new_uid_s {
        if let Some(existing) = owner_of_id(passwd, &new_uid_s) {
            return unchanged(UidGidOutcome::UidTaken {
                existing_user: existing.to_string(),
                uid: new_uid,
            });
        }
    }

    let mut gid_collision = None;
    let mut effective_gid = new_gid_s;
    if entry.gid != effective_gid {
        if let Some(existing) = owner_of_id(group, &effective_gid) {
            gid_collision = Some(existing.to_string());
            effective_gid = entry.gid.to_string();
        }
    }

    let new_passwd = rewrite_lines(passwd, |line| {
        let mut f = fields(line);
        if f.len() >= 4 && f[0] == user {
            f[2] = &new_uid_s;
            f[3] = &effective_gid;
            Some(f.join(":"))
        } else {
            None
        }
    });
    let new_group = (entry.gid != effective_gid).then(|| {
        rewrite_lines(group, |line| {
            let mut f = fields(line);
            if f.len() >= 3 && f[2] == entry.gid {
                f[2] = &effective_gid;
                Some(f.join(":"))
            } else {
                None
            }
        })
    });

    UidGidPatch {
        outcome: UidGidOutcome::Updated {
            old_uid: parse_id(entry.uid),
            old_gid: parse_id(entry.gid),
            new_uid,
            new_gid: parse_id(&effective_gid),
            gid_collision,
        },
        passwd: Some(new_passwd),
        group: new_group,
        home: Some(entry.home.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
                          ws:x:1000:1000::/home/ws:/bin/bash\n\
                          node:x:1001:1001::/home/node:/bin/sh\n";
    const GROUP: &str = "root:x:0:\nws:x:1000:\nnode:x:1001:\ndocker:x:999:ws\n";

    #[test]
    fn test_root_host_clones_as_root() {
        assert_eq!(clone_user_for(0, 0), "root");
        assert_eq!(clone_user_for(0, 1000), CLONE_USER);
        assert_eq!(clone_user_for(1000, 1000), CLONE_USER);
    }

    #[test]
    fn test_same_ids_unchanged() {
        let patch = reconcile(PASSWD, GROUP, "ws", 1000, 1000);
        assert_eq!(patch.outcome, UidGidOutcome::Unchanged { uid: 1000, gid: 1000 });
        assert!(patch.passwd.is_none());
        assert!(patch.group.is_none());
    }

    #[test]
    fn test_missing_user_unchanged() {
        let patch = reconcile(PASSWD, GROUP, "ghost", 501, 20);
        assert!(matches!(patch.outcome, UidGidOutcome::UserNotFound { .. }));
        assert!(patch.home.is_none());
    }

    #[test]
    fn test_uid_owned_by_other_user_unchanged() {
        let patch = reconcile(PASSWD, GROUP, "ws", 1001, 1001);
        assert_eq!(
            patch.outcome,
            UidGidOutcome::UidTaken {
                existing_user: "node".into(),
                uid: 1001
            }
        );
        assert!(patch.passwd.is_none());
    }

    #[test]
    fn test_free_ids_update_passwd_and_group() {
        let patch = reconcile(PASSWD, GROUP, "ws", 501, 20);

        assert_eq!(
            patch.outcome,
            UidGidOutcome::Updated {
                old_uid: 1000,
                old_gid: 1000,
                new_uid: 501,
                new_gid: 20,
                gid_collision: None,
            }
        );
        let passwd = patch.passwd.unwrap();
        assert!(passwd.contains("ws:x:501:20::/home/ws:/bin/bash\n"));
        assert!(passwd.contains("node:x:1001:1001:"));
        assert!(patch.group.unwrap().contains("ws:x:20:\n"));
        assert_eq!(patch.home.as_deref(), Some("/home/ws"));
    }

    // GID collision: the UID moves, the GID deliberately stays where it was.
    #[test]
    fn test_gid_collision_keeps_old_gid_but_updates_uid() {
        let patch = reconcile(PASSWD, GROUP, "ws", 501, 999);

        assert_eq!(
            patch.outcome,
            UidGidOutcome::Updated {
                old_uid: 1000,
                old_gid: 1000,
                new_uid: 501,
                new_gid: 1000,
                gid_collision: Some("docker".into()),
            }
        );
        assert!(patch.passwd.unwrap().contains("ws:x:501:1000:"));
        assert!(patch.group.is_none());
    }

    #[test]
    fn test_gid_only_change_for_same_uid() {
        let patch = reconcile(PASSWD, GROUP, "ws", 1000, 50);

        assert!(matches!(
            patch.outcome,
            UidGidOutcome::Updated {
                new_uid: 1000,
                new_gid: 50,
                gid_collision: None,
                ..
            }
        ));
        assert!(patch.group.unwrap().contains("ws:x:50:"));
    }

    #[test]
    fn test_outcome_messages() {
        let updated = reconcile(PASSWD, GROUP, "ws", 501, 999).outcome.to_string();
        assert!(updated.contains("Group with GID exists (docker)"));
        assert!(updated.ends_with("Updating UID:GID from 1000:1000 to 501:1000."));
    }
}
