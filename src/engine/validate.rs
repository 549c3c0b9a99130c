use std::fmt;
use std::str::FromStr;

use ulid::Ulid;

use crate::model::*;

use super::conflict::{find_conflicts, IntervalStore};

/// How two endpoints of one pair must be ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointOrder {
    /// `start < end`; a zero-length reservation or lend is rejected.
    #[default]
    Strict,
    /// `start <= end`.
    AllowEqual,
}

impl EndpointOrder {
    pub fn in_order<T: Ord>(self, start: T, end: T) -> bool {
        match self {
            EndpointOrder::Strict => start < end,
            EndpointOrder::AllowEqual => start <= end,
        }
    }
}

impl FromStr for EndpointOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(EndpointOrder::Strict),
            "inclusive" | "allow_equal" => Ok(EndpointOrder::AllowEqual),
            other => Err(format!("unknown endpoint order: {other}")),
        }
    }
}

/// A lend submission as it arrives from a client, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LendCandidate {
    pub item_id: Ulid,
    pub due_out: Option<Day>,
    pub due_back: Option<Day>,
    pub out: Option<Timestamp>,
    pub back: Option<Timestamp>,
    /// The record being edited, if this is an update.
    pub exclude_record_id: Option<Ulid>,
}

impl LendCandidate {
    pub fn new(item_id: Ulid) -> Self {
        Self {
            item_id,
            due_out: None,
            due_back: None,
            out: None,
            back: None,
            exclude_record_id: None,
        }
    }

    pub fn from_record(lend: &LendRecord, exclude_record_id: Option<Ulid>) -> Self {
        Self {
            item_id: lend.item_id,
            due_out: lend.due_out,
            due_back: lend.due_back,
            out: lend.out,
            back: lend.back,
            exclude_record_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    MissingBothDates,
    BackRequiresOut,
    DueBackRequiresDueOut,
    ReservationOrderInvalid,
    LendOrderInvalid,
    ReservationConflict,
    LendConflict,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::MissingBothDates => "MissingBothDates",
            ViolationKind::BackRequiresOut => "BackRequiresOut",
            ViolationKind::DueBackRequiresDueOut => "DueBackRequiresDueOut",
            ViolationKind::ReservationOrderInvalid => "ReservationOrderInvalid",
            ViolationKind::LendOrderInvalid => "LendOrderInvalid",
            ViolationKind::ReservationConflict => "ReservationConflict",
            ViolationKind::LendConflict => "LendConflict",
        }
    }

    pub fn is_conflict(self) -> bool {
        matches!(self, ViolationKind::ReservationConflict | ViolationKind::LendConflict)
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One broken rule, with the data needed to explain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    MissingBothDates,
    BackRequiresOut,
    DueBackRequiresDueOut,
    ReservationOrderInvalid {
        due_out: Day,
        due_back: Day,
    },
    LendOrderInvalid {
        out: Timestamp,
        back: Timestamp,
    },
    ReservationConflict {
        candidate: Window<Day>,
        conflicts: Vec<Interval<Day>>,
    },
    LendConflict {
        candidate: Window<Timestamp>,
        conflicts: Vec<Interval<Timestamp>>,
    },
}

impl Violation {
    pub fn kind(&self) -> ViolationKind {
        match self {
            Violation::MissingBothDates => ViolationKind::MissingBothDates,
            Violation::BackRequiresOut => ViolationKind::BackRequiresOut,
            Violation::DueBackRequiresDueOut => ViolationKind::DueBackRequiresDueOut,
            Violation::ReservationOrderInvalid { .. } => ViolationKind::ReservationOrderInvalid,
            Violation::LendOrderInvalid { .. } => ViolationKind::LendOrderInvalid,
            Violation::ReservationConflict { .. } => ViolationKind::ReservationConflict,
            Violation::LendConflict { .. } => ViolationKind::LendConflict,
        }
    }

    /// Record ids of the intervals this violation collides with.
    pub fn conflicting_records(&self) -> Vec<Ulid> {
        match self {
            Violation::ReservationConflict { conflicts, .. } => {
                conflicts.iter().map(|c| c.record_id).collect()
            }
            Violation::LendConflict { conflicts, .. } => {
                conflicts.iter().map(|c| c.record_id).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn write_conflicts<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    verb: &str,
    noun: &str,
    prefix: &str,
    candidate: &Window<T>,
    conflicts: &[Interval<T>],
) -> fmt::Result {
    write!(f, "cannot {verb} item from {candidate}: ")?;
    match conflicts.len() {
        1 => write!(f, "there is 1 conflicting {noun}: ")?,
        n => write!(f, "there are {n} conflicting {noun}s: ")?,
    }
    for (i, c) in conflicts.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{prefix} from {}", c.window)?;
    }
    Ok(())
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingBothDates => write!(f, r#"either "due_out" or "out" must be set"#),
            Violation::BackRequiresOut => {
                write!(f, r#"if "back" is set, "out" must also be set"#)
            }
            Violation::DueBackRequiresDueOut => {
                write!(f, r#"if "due_back" is set, "due_out" must also be set"#)
            }
            Violation::ReservationOrderInvalid { due_out, due_back } => write!(
                f,
                r#""due_out" ({due_out}) must occur before "due_back" ({due_back})"#
            ),
            Violation::LendOrderInvalid { out, back } => {
                write!(f, r#""out" ({out}) must occur before "back" ({back})"#)
            }
            Violation::ReservationConflict { candidate, conflicts } => {
                write_conflicts(f, "reserve", "reservation", "reserved", candidate, conflicts)
            }
            Violation::LendConflict { candidate, conflicts } => {
                write_conflicts(f, "lend", "lend", "out", candidate, conflicts)
            }
        }
    }
}

/// Every rule a submission broke, in rule order. Never empty when returned
/// as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(Vec<Violation>);

impl ValidationErrors {
    pub fn violations(&self) -> &[Violation] {
        &self.0
    }

    pub fn kinds(&self) -> Vec<ViolationKind> {
        self.0.iter().map(Violation::kind).collect()
    }

    pub fn contains(&self, kind: ViolationKind) -> bool {
        self.0.iter().any(|v| v.kind() == kind)
    }

    /// True when every violation is a conflict with another record.
    pub fn only_conflicts(&self) -> bool {
        self.0.iter().all(|v| v.kind().is_conflict())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Violation> {
        self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Outcome of [`validate_lend`] when the lend cannot be accepted.
#[derive(Debug)]
pub enum LendError<E> {
    /// The submission is invalid; the caller should show the violations.
    Invalid(ValidationErrors),
    /// The interval store failed while answering a conflict query.
    Store(E),
}

impl<E: fmt::Display> fmt::Display for LendError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LendError::Invalid(errors) => write!(f, "invalid lend: {errors}"),
            LendError::Store(e) => write!(f, "interval store error: {e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for LendError<E> {}

/// Run every lend rule against `candidate` and collect all violations.
///
/// Structural and ordering rules come first. A pair whose start is missing
/// or whose endpoints are out of order is not conflict-checked.
pub fn validate_lend<S: IntervalStore + ?Sized>(
    candidate: &LendCandidate,
    store: &S,
    order: EndpointOrder,
) -> Result<(), LendError<S::Error>> {
    let mut violations = Vec::new();

    if candidate.due_out.is_none() && candidate.out.is_none() {
        violations.push(Violation::MissingBothDates);
    }
    if candidate.back.is_some() && candidate.out.is_none() {
        violations.push(Violation::BackRequiresOut);
    }
    if candidate.due_back.is_some() && candidate.due_out.is_none() {
        violations.push(Violation::DueBackRequiresDueOut);
    }

    let reservation = match (candidate.due_out, candidate.due_back) {
        (Some(due_out), Some(due_back)) if !order.in_order(due_out, due_back) => {
            violations.push(Violation::ReservationOrderInvalid { due_out, due_back });
            None
        }
        (Some(due_out), due_back) => Some(Window::new(due_out, due_back)),
        (None, _) => None,
    };

    let checkout = match (candidate.out, candidate.back) {
        (Some(out), Some(back)) if !order.in_order(out, back) => {
            violations.push(Violation::LendOrderInvalid { out, back });
            None
        }
        (Some(out), back) => Some(Window::new(out, back)),
        (None, _) => None,
    };

    if let Some(window) = reservation {
        let conflicts = find_conflicts::<ReservationGrain, S>(
            store,
            candidate.item_id,
            Some(window.start),
            window.end,
            candidate.exclude_record_id,
        )
        .map_err(LendError::Store)?;
        if !conflicts.is_empty() {
            violations.push(Violation::ReservationConflict { candidate: window, conflicts });
        }
    }

    if let Some(window) = checkout {
        let conflicts = find_conflicts::<LendGrain, S>(
            store,
            candidate.item_id,
            Some(window.start),
            window.end,
            candidate.exclude_record_id,
        )
        .map_err(LendError::Store)?;
        if !conflicts.is_empty() {
            violations.push(Violation::LendConflict { candidate: window, conflicts });
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(LendError::Invalid(ValidationErrors(violations)))
    }
}
