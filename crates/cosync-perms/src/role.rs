//! Roles and group entry keys.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use cosync_core::{ActorId, CoId, KeyId};

use crate::error::PermsError;

/// A member's role in a group.
///
/// Regular roles are ordered by strength:
/// revoked < writeOnly < reader < writer < admin. Invite roles are held by
/// invite agents and only allow granting the matching role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Revoked,
    WriteOnly,
    Reader,
    Writer,
    Admin,
    ReaderInvite,
    WriterInvite,
    AdminInvite,
}

impl Role {
    /// Strength among regular roles; invite roles rank with revoked.
    pub fn rank(self) -> u8 {
        match self {
            Role::Revoked | Role::ReaderInvite | Role::WriterInvite | Role::AdminInvite => 0,
            Role::WriteOnly => 1,
            Role::Reader => 2,
            Role::Writer => 3,
            Role::Admin => 4,
        }
    }

    pub fn can_read(self) -> bool {
        matches!(self, Role::Reader | Role::Writer | Role::Admin)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Role::WriteOnly | Role::Writer | Role::Admin)
    }

    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }

    pub fn is_invite(self) -> bool {
        matches!(self, Role::ReaderInvite | Role::WriterInvite | Role::AdminInvite)
    }

    /// The invite role that grants `self`.
    pub fn invite_role(self) -> Option<Role> {
        match self {
            Role::Reader => Some(Role::ReaderInvite),
            Role::Writer => Some(Role::WriterInvite),
            Role::Admin => Some(Role::AdminInvite),
            _ => None,
        }
    }

    /// The role an invite grants on redemption.
    pub fn granted_by_invite(self) -> Option<Role> {
        match self {
            Role::ReaderInvite => Some(Role::Reader),
            Role::WriterInvite => Some(Role::Writer),
            Role::AdminInvite => Some(Role::Admin),
            _ => None,
        }
    }

    /// The stronger of two roles; invite roles never win.
    pub fn max(self, other: Role) -> Role {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Revoked => "revoked",
            Role::WriteOnly => "writeOnly",
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Admin => "admin",
            Role::ReaderInvite => "readerInvite",
            Role::WriterInvite => "writerInvite",
            Role::AdminInvite => "adminInvite",
        }
    }

    /// Parse a role stored as a JSON string.
    pub fn from_value(value: &Value) -> Option<Role> {
        value.as_str()?.parse().ok()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "revoked" => Role::Revoked,
            "writeOnly" => Role::WriteOnly,
            "reader" => Role::Reader,
            "writer" => Role::Writer,
            "admin" => Role::Admin,
            "readerInvite" => Role::ReaderInvite,
            "writerInvite" => Role::WriterInvite,
            "adminInvite" => Role::AdminInvite,
            other => return Err(PermsError::InvalidRole(other.to_string())),
        })
    }
}

/// How a child group inherits roles from a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRole {
    /// Members keep their parent role.
    Extend,
    /// Parent roles are capped at this role.
    Cap(Role),
    /// The link is cut.
    Revoked,
}

impl ParentRole {
    pub fn from_value(value: &Value) -> Option<ParentRole> {
        match value.as_str()? {
            "extend" | "inherit" => Some(ParentRole::Extend),
            "revoked" => Some(ParentRole::Revoked),
            other => match other.parse().ok()? {
                role @ (Role::WriteOnly | Role::Reader | Role::Writer | Role::Admin) => {
                    Some(ParentRole::Cap(role))
                }
                _ => None,
            },
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            ParentRole::Extend => Value::from("extend"),
            ParentRole::Cap(role) => Value::from(role.as_str()),
            ParentRole::Revoked => Value::from("revoked"),
        }
    }

    /// Apply the link to a role held in the parent.
    pub fn inherit(self, parent_role: Role) -> Option<Role> {
        if parent_role.is_invite() || parent_role == Role::Revoked {
            return None;
        }
        match self {
            ParentRole::Extend => Some(parent_role),
            ParentRole::Cap(cap) if cap.is_invite() || cap == Role::Revoked => None,
            ParentRole::Cap(cap) if parent_role.rank() <= cap.rank() => Some(parent_role),
            ParentRole::Cap(cap) => Some(cap),
            ParentRole::Revoked => None,
        }
    }
}

/// Target of a key reveal entry `<key>_for_<target>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealTarget {
    Member(ActorId),
    Everyone,
    Key(KeyId),
}

impl fmt::Display for RevealTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevealTarget::Member(actor) => write!(f, "{}", actor),
            RevealTarget::Everyone => f.write_str(EVERYONE),
            RevealTarget::Key(key) => write!(f, "{}", key),
        }
    }
}

const EVERYONE: &str = "everyone";
const READ_KEY: &str = "readKey";
const PARENT_PREFIX: &str = "parent_";
const CHILD_PREFIX: &str = "child_";
const WRITE_KEY_PREFIX: &str = "writeKeyFor_";
const REVEAL_SEPARATOR: &str = "_for_";

/// Interpretation of a key in a group's map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEntryKey {
    Member(ActorId),
    Everyone,
    ReadKey,
    Parent(CoId),
    Child(CoId),
    WriteKeyFor(ActorId),
    KeyReveal { key: KeyId, target: RevealTarget },
    Other(String),
}

impl GroupEntryKey {
    pub fn parse(key: &str) -> GroupEntryKey {
        if key == EVERYONE {
            return GroupEntryKey::Everyone;
        }
        if key == READ_KEY {
            return GroupEntryKey::ReadKey;
        }
        if let Some(group) = key.strip_prefix(PARENT_PREFIX).and_then(|g| g.parse().ok()) {
            return GroupEntryKey::Parent(group);
        }
        if let Some(group) = key.strip_prefix(CHILD_PREFIX).and_then(|g| g.parse().ok()) {
            return GroupEntryKey::Child(group);
        }
        if let Some(member) = key.strip_prefix(WRITE_KEY_PREFIX).and_then(|m| m.parse().ok()) {
            return GroupEntryKey::WriteKeyFor(member);
        }
        if let Some((key_id, target)) = key.split_once(REVEAL_SEPARATOR) {
            if let Ok(key_id) = key_id.parse::<KeyId>() {
                let target = if target == EVERYONE {
                    Some(RevealTarget::Everyone)
                } else if let Ok(other) = target.parse::<KeyId>() {
                    Some(RevealTarget::Key(other))
                } else {
                    target.parse().ok().map(RevealTarget::Member)
                };
                if let Some(target) = target {
                    return GroupEntryKey::KeyReveal {
                        key: key_id,
                        target,
                    };
                }
            }
        }
        match key.parse() {
            Ok(actor) => GroupEntryKey::Member(actor),
            Err(_) => GroupEntryKey::Other(key.to_string()),
        }
    }
}

impl fmt::Display for GroupEntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupEntryKey::Member(actor) => write!(f, "{}", actor),
            GroupEntryKey::Everyone => f.write_str(EVERYONE),
            GroupEntryKey::ReadKey => f.write_str(READ_KEY),
            GroupEntryKey::Parent(group) => write!(f, "{}{}", PARENT_PREFIX, group),
            GroupEntryKey::Child(group) => write!(f, "{}{}", CHILD_PREFIX, group),
            GroupEntryKey::WriteKeyFor(actor) => write!(f, "{}{}", WRITE_KEY_PREFIX, actor),
            GroupEntryKey::KeyReveal { key, target } => {
                write!(f, "{}{}{}", key, REVEAL_SEPARATOR, target)
            }
            GroupEntryKey::Other(key) => f.write_str(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosync_core::{AgentSecret, KeySecret};

    #[test]
    fn test_role_order() {
        assert!(Role::Admin.rank() > Role::Writer.rank());
        assert!(Role::Writer.rank() > Role::Reader.rank());
        assert!(Role::Reader.rank() > Role::WriteOnly.rank());
        assert!(Role::WriteOnly.rank() > Role::Revoked.rank());
        assert_eq!(Role::Reader.max(Role::ReaderInvite), Role::Reader);
    }

    #[test]
    fn test_role_text_roundtrip() {
        for role in [
            Role::Revoked,
            Role::WriteOnly,
            Role::Reader,
            Role::Writer,
            Role::Admin,
            Role::ReaderInvite,
            Role::WriterInvite,
            Role::AdminInvite,
        ] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_parent_role_inherit() {
        assert_eq!(ParentRole::Extend.inherit(Role::Admin), Some(Role::Admin));
        assert_eq!(ParentRole::Cap(Role::Reader).inherit(Role::Admin), Some(Role::Reader));
        assert_eq!(ParentRole::Cap(Role::Writer).inherit(Role::Reader), Some(Role::Reader));
        assert_eq!(ParentRole::Revoked.inherit(Role::Admin), None);
        assert_eq!(ParentRole::Extend.inherit(Role::WriterInvite), None);
    }

    #[test]
    fn test_entry_key_parse() {
        let agent = ActorId::Agent(AgentSecret::generate().id());
        let account = ActorId::Account(CoId([1; 32]));
        let key = KeySecret::generate().id();
        let other_key = KeySecret::generate().id();

        let cases = vec![
            GroupEntryKey::Member(agent),
            GroupEntryKey::Member(account),
            GroupEntryKey::Everyone,
            GroupEntryKey::ReadKey,
            GroupEntryKey::Parent(CoId([2; 32])),
            GroupEntryKey::Child(CoId([3; 32])),
            GroupEntryKey::WriteKeyFor(account),
            GroupEntryKey::KeyReveal {
                key,
                target: RevealTarget::Member(agent),
            },
            GroupEntryKey::KeyReveal {
                key,
                target: RevealTarget::Everyone,
            },
            GroupEntryKey::KeyReveal {
                key,
                target: RevealTarget::Key(other_key),
            },
            GroupEntryKey::Other("profile".into()),
        ];
        for case in cases {
            assert_eq!(GroupEntryKey::parse(&case.to_string()), case);
        }
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn role() -> impl Strategy<Value = Role> {
            prop_oneof![
                Just(Role::Revoked),
                Just(Role::WriteOnly),
                Just(Role::Reader),
                Just(Role::Writer),
                Just(Role::Admin),
                Just(Role::ReaderInvite),
                Just(Role::WriterInvite),
                Just(Role::AdminInvite),
            ]
        }

        proptest! {
            #[test]
            fn inherited_role_never_exceeds_cap(cap in role(), held in role()) {
                if let Some(inherited) = ParentRole::Cap(cap).inherit(held) {
                    prop_assert!(inherited.rank() <= cap.rank());
                    prop_assert!(inherited.rank() <= held.rank());
                    prop_assert!(!inherited.is_invite());
                }
            }

            #[test]
            fn max_keeps_stronger_role(a in role(), b in role()) {
                let m = a.max(b);
                prop_assert_eq!(m.rank(), a.rank().max(b.rank()));
                prop_assert_eq!(m.max(a), m);
                prop_assert_eq!(a.max(b).rank(), b.max(a).rank());
            }
        }
    }
}
