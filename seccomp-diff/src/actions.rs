use libseccomp::ScmpAction;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Display;
use std::num::TryFromIntError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("errno value is out of u16 range")]
    ErrnoOutOfRange(#[from] TryFromIntError),
    #[error("Unknown action")]
    UnknownAction,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum Action {
    #[default]
    #[serde(
        rename = "SCMP_ACT_KILL_PROCESS",
        alias = "SCMP_ACT_KILL",
        alias = "KillProcess"
    )]
    KillProcess,
    #[serde(rename = "SCMP_ACT_KILL_THREAD", alias = "KillThread")]
    KillThread,
    #[serde(rename = "SCMP_ACT_TRAP", alias = "Trap")]
    Trap,
    #[serde(rename = "SCMP_ACT_ERRNO", alias = "Errno")]
    Errno,
    #[serde(rename = "SCMP_ACT_NOTIFY", alias = "Notify")]
    Notify,
    #[serde(rename = "SCMP_ACT_TRACE", alias = "Trace")]
    Trace,
    #[serde(rename = "SCMP_ACT_LOG", alias = "Log")]
    Log,
    #[serde(rename = "SCMP_ACT_ALLOW", alias = "Allow")]
    Allow,
    #[serde(other)]
    Unknown,
}

impl Action {
    fn restrictiveness_level(&self) -> u8 {
        match self {
            Action::KillProcess => 8,
            Action::KillThread => 7,
            Action::Trap => 6,
            Action::Errno => 5,
            Action::Notify => 4,
            Action::Trace => 3,
            Action::Log => 2,
            Action::Allow => 1,
            Action::Unknown => 0,
        }
    }

    pub fn to_scmp_action(&self, errno: Option<u32>) -> Result<ScmpAction, ActionError> {
        let eperm = nix::libc::EPERM as u32;
        match self {
            Action::KillProcess => Ok(ScmpAction::KillProcess),
            Action::KillThread => Ok(ScmpAction::KillThread),
            Action::Trap => Ok(ScmpAction::Trap),
            Action::Errno => {
                let errno: u16 = errno.unwrap_or(eperm).try_into()?;
                Ok(ScmpAction::Errno(i32::from(errno)))
            }
            Action::Notify => Ok(ScmpAction::Notify),
            Action::Trace => Ok(ScmpAction::Trace(errno.unwrap_or(0).try_into()?)),
            Action::Allow => Ok(ScmpAction::Allow),
            Action::Log => Ok(ScmpAction::Log),
            Action::Unknown => Err(ActionError::UnknownAction),
        }
    }
}

impl PartialOrd for Action {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Action {
    fn cmp(&self, other: &Self) -> Ordering {
        self.restrictiveness_level()
            .cmp(&other.restrictiveness_level())
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x80000000;
pub const SECCOMP_RET_KILL_THREAD: u32 = 0x00000000;
pub const SECCOMP_RET_TRAP: u32 = 0x00030000;
pub const SECCOMP_RET_ERRNO: u32 = 0x00050000;
pub const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc00000;
pub const SECCOMP_RET_TRACE: u32 = 0x7ff00000;
pub const SECCOMP_RET_LOG: u32 = 0x7ffc0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff0000;

/* Masks for the return value sections. */
const SECCOMP_RET_ACTION_FULL: u32 = 0xffff0000;
const SECCOMP_RET_DATA: u32 = 0x0000ffff;

impl Action {
    pub fn to_class(self) -> u32 {
        match self {
            Action::KillProcess => SECCOMP_RET_KILL_PROCESS,
            Action::KillThread => SECCOMP_RET_KILL_THREAD,
            Action::Trap => SECCOMP_RET_TRAP,
            Action::Errno => SECCOMP_RET_ERRNO,
            Action::Notify => SECCOMP_RET_USER_NOTIF,
            Action::Trace => SECCOMP_RET_TRACE,
            Action::Allow => SECCOMP_RET_ALLOW,
            Action::Log => SECCOMP_RET_LOG,
            Action::Unknown => SECCOMP_RET_KILL_THREAD,
        }
    }

    pub fn from_class(class: u32) -> Option<Self> {
        Some(match class & SECCOMP_RET_ACTION_FULL {
            SECCOMP_RET_KILL_PROCESS => Action::KillProcess,
            SECCOMP_RET_KILL_THREAD => Action::KillThread,
            SECCOMP_RET_TRAP => Action::Trap,
            SECCOMP_RET_ERRNO => Action::Errno,
            SECCOMP_RET_USER_NOTIF => Action::Notify,
            SECCOMP_RET_TRACE => Action::Trace,
            SECCOMP_RET_ALLOW => Action::Allow,
            SECCOMP_RET_LOG => Action::Log,
            _ => return None,
        })
    }
}

// ============================================================================
// Verdicts
// ============================================================================

/// Raw value returned by a seccomp program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Verdict(pub u32);

impl Verdict {
    pub fn new(action: Action, data: u16) -> Self {
        Verdict(action.to_class() | u32::from(data))
    }

    pub fn action(self) -> Action {
        Action::from_class(self.0).unwrap_or(Action::Unknown)
    }

    pub fn data(self) -> u16 {
        (self.0 & SECCOMP_RET_DATA) as u16
    }
}

impl From<u32> for Verdict {
    fn from(ret: u32) -> Self {
        Verdict(ret)
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.action() {
            Action::Unknown => write!(f, "Unknown({:#010x})", self.0),
            action @ (Action::Errno | Action::Trace | Action::Trap) => {
                write!(f, "{}({})", action, self.data())
            }
            action if self.data() != 0 => write!(f, "{}({})", action, self.data()),
            action => write!(f, "{}", action),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libseccomp::ScmpAction;

    #[test]
    fn test_restrictiveness_order() {
        assert!(Action::KillProcess > Action::KillThread);
        assert!(Action::Errno > Action::Log);
        assert!(Action::Log > Action::Allow);
        assert_eq!(
            [Action::Allow, Action::Trap, Action::Log].iter().max(),
            Some(&Action::Trap)
        );
    }

    #[test]
    fn test_to_scmp_action_conversion() {
        assert_eq!(
            Action::KillProcess.to_scmp_action(None).unwrap(),
            ScmpAction::KillProcess
        );
        assert_eq!(Action::Trap.to_scmp_action(None).unwrap(), ScmpAction::Trap);
        assert_eq!(Action::Log.to_scmp_action(None).unwrap(), ScmpAction::Log);

        let eperm = nix::libc::EPERM;
        assert_eq!(
            Action::Errno.to_scmp_action(None).unwrap(),
            ScmpAction::Errno(eperm)
        );
        assert_eq!(
            Action::Errno.to_scmp_action(Some(123)).unwrap(),
            ScmpAction::Errno(123)
        );
        assert!(Action::Errno.to_scmp_action(Some(70000)).is_err());

        assert_eq!(
            Action::Trace.to_scmp_action(Some(456)).unwrap(),
            ScmpAction::Trace(456)
        );
        assert!(Action::Trace
            .to_scmp_action(Some(u16::MAX as u32 + 1))
            .is_err());
        assert!(Action::Unknown.to_scmp_action(None).is_err());
    }

    #[test]
    fn test_from_class_keeps_kill_process_apart() {
        assert_eq!(
            Action::from_class(SECCOMP_RET_KILL_PROCESS),
            Some(Action::KillProcess)
        );
        assert_eq!(
            Action::from_class(SECCOMP_RET_KILL_THREAD),
            Some(Action::KillThread)
        );
        assert_eq!(Action::from_class(SECCOMP_RET_ERRNO | 13), Some(Action::Errno));
        assert_eq!(Action::from_class(0x1234_0000), None);
    }

    #[test]
    fn test_verdict() {
        let verdict = Verdict::new(Action::Errno, 1);
        assert_eq!(verdict.0, 0x0005_0001);
        assert_eq!(verdict.action(), Action::Errno);
        assert_eq!(verdict.data(), 1);
        assert_eq!(verdict.to_string(), "Errno(1)");

        assert_eq!(Verdict(SECCOMP_RET_ALLOW).to_string(), "Allow");
        assert_eq!(Verdict(0x0042_0000).to_string(), "Unknown(0x00420000)");
        assert_eq!(Verdict(SECCOMP_RET_KILL_PROCESS).action(), Action::KillProcess);
    }

    #[test]
    fn test_ordering() {
        assert!(Action::KillProcess > Action::Errno);
        assert!(Action::Errno > Action::Log);
        assert!(Action::Log > Action::Allow);
    }
}
