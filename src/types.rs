//! Core vocabulary shared by every workflow component
use chrono::{DateTime, TimeZone, Utc};

/// Actor roles recognised by the permission tables.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Bypasses every permission check.
    #[n(0)]
    Admin,
    /// Authorizer for the critical path, supervisory cancel rights.
    #[n(1)]
    AssetDirector,
    /// Verifier for the critical path, supervisory cancel rights.
    #[n(2)]
    ProjectManager,
    /// Operational role: creates requests, releases stock, handles returns.
    #[n(3)]
    Warehouseman,
    /// Field staff, may raise requests for their own project.
    #[n(4)]
    SiteWorker,
}

/// The business processes that share the workflow core.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Consumable stock leaving the warehouse for good.
    #[n(0)]
    Withdrawal,
    /// Tools on loan, expected back.
    #[n(1)]
    BorrowedTool,
    /// Stock moving between projects through an in-transit leg.
    #[n(2)]
    Transfer,
    /// Catch-all request that releases and completes.
    #[n(3)]
    GenericRequest,
}

/// Determines whether the full maker-verifier-authorizer chain applies
/// or the shortened streamlined path is available.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Criticality {
    #[n(0)]
    Basic,
    #[n(1)]
    Critical,
}

/// Workflow states. `Overdue` is deliberately absent: it is a read-time
/// derived flag on Released/Borrowed/InTransit, never a state of its own.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    PendingVerification,
    #[n(2)]
    PendingApproval,
    #[n(3)]
    Approved,
    #[n(4)]
    Released,
    #[n(5)]
    Borrowed,
    #[n(6)]
    InTransit,
    #[n(7)]
    Received,
    #[n(8)]
    Completed,
    #[n(9)]
    Returned,
    #[n(10)]
    Cancelled,
    #[n(11)]
    Declined,
}

impl RequestStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Returned
                | RequestStatus::Cancelled
                | RequestStatus::Declined
        )
    }

    /// True until stock has physically left the warehouse.
    pub fn is_pre_release(&self) -> bool {
        matches!(
            self,
            RequestStatus::Draft
                | RequestStatus::PendingVerification
                | RequestStatus::PendingApproval
                | RequestStatus::Approved
        )
    }

    /// States in which someone outside the warehouse holds custody.
    pub fn is_in_custody(&self) -> bool {
        matches!(
            self,
            RequestStatus::Released | RequestStatus::Borrowed | RequestStatus::InTransit
        )
    }
}

/// Every operation the workflow core dispatches. A tagged enum, never a
/// string-typed method name.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    #[n(0)]
    Create,
    #[n(1)]
    Submit,
    #[n(2)]
    Verify,
    #[n(3)]
    Approve,
    #[n(4)]
    Release,
    #[n(5)]
    Dispatch,
    #[n(6)]
    Receive,
    #[n(7)]
    Complete,
    #[n(8)]
    Return,
    #[n(9)]
    Cancel,
    #[n(10)]
    Decline,
}

/// Condition reported for a line item when it comes back.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCondition {
    /// Back on the shelf, quantity restored.
    #[n(0)]
    Good,
    /// Came back unusable. Restores zero units and raises an incident.
    #[n(1)]
    Damaged,
    /// Never came back. Restores zero units and raises an incident.
    #[n(2)]
    Lost,
    /// Used up as intended, nothing to restore.
    #[n(3)]
    Consumed,
}

impl ReturnCondition {
    /// Whether any physical quantity goes back on the shelf.
    pub fn restores_stock(&self) -> bool {
        matches!(self, ReturnCondition::Good)
    }

    /// Damaged and lost items become incidents for the external sink.
    pub fn raises_incident(&self) -> bool {
        matches!(self, ReturnCondition::Damaged | ReturnCondition::Lost)
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl<T: TimeZone + Eq> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone + Eq> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
