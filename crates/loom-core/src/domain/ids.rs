//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID。`Id<T>` で共通実装を持ち、`T` はマーカー型なので
//! `JobId` と `ScheduleId` は混同できない。
//!
//! Backend から返されるのはこの ID だけで、ジョブの実体（永続化・実行・期限切れ）は
//! Backend 側が所有する。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"job-", "schedule-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Parse error for identifiers handed back by callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier '{0}'")]
pub struct ParseIdError(pub String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(T::prefix())
            .ok_or_else(|| ParseIdError(s.to_string()))?;
        let ulid = Ulid::from_string(raw).map_err(|_| ParseIdError(s.to_string()))?;
        Ok(Self::from_ulid(ulid))
    }
}

/// Job のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Schedule のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Schedule {}

impl IdMarker for Schedule {
    fn prefix() -> &'static str {
        "schedule-"
    }
}

pub type JobId = Id<Job>;
pub type ScheduleId = Id<Schedule>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_prefix() {
        let ulid = Ulid::new();
        let job_id = JobId::from_ulid(ulid);
        let schedule_id = ScheduleId::from_ulid(ulid);

        assert_eq!(job_id.to_string(), format!("job-{ulid}"));
        assert_eq!(schedule_id.to_string(), format!("schedule-{ulid}"));
    }

    #[test]
    fn parses_back_from_display() {
        let job_id = JobId::from_ulid(Ulid::new());
        let parsed: JobId = job_id.to_string().parse().unwrap();
        assert_eq!(parsed, job_id);
    }

    #[test]
    fn rejects_foreign_prefix() {
        let schedule_id = ScheduleId::from_ulid(Ulid::new());
        let parsed = schedule_id.to_string().parse::<JobId>();
        assert!(matches!(parsed, Err(ParseIdError(_))));
    }
}
