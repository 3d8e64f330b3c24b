//! Status helper enums mapping to SMALLSERIAL/SMALLINT lookup tables.
//!
//! Each enum variant's discriminant matches the seed data order (1-based)
//! in the corresponding `*_statuses` database table.

use std::fmt;

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up a variant by its database status ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// Lowercase name matching the seed data.
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

define_status_enum! {
    /// Generation request lifecycle status.
    RequestStatus {
        Pending = 1 => "pending",
        Processing = 2 => "processing",
        Completed = 3 => "completed",
        Failed = 4 => "failed",
        Cancelled = 5 => "cancelled",
    }
}

/// Statuses that count against the per-owner concurrency cap.
pub const ACTIVE_STATUSES: [RequestStatus; 2] = [RequestStatus::Pending, RequestStatus::Processing];

impl RequestStatus {
    /// Completed, failed and cancelled requests never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }

    /// Statuses from which a write of `self` is a real transition.
    ///
    /// Nothing transitions back to `Pending`, and terminal states have no
    /// outgoing transitions.
    pub fn allowed_sources(self) -> &'static [RequestStatus] {
        match self {
            RequestStatus::Pending => &[],
            RequestStatus::Processing => &[RequestStatus::Pending],
            RequestStatus::Completed => &[RequestStatus::Processing],
            RequestStatus::Failed | RequestStatus::Cancelled => {
                &[RequestStatus::Pending, RequestStatus::Processing]
            }
        }
    }

    /// Whether a status write of `to` is accepted while the request is in
    /// `self`. Writing the current status again is accepted so that fields
    /// can be attached (external job id, error annotation).
    pub fn accepts(self, to: RequestStatus) -> bool {
        self == to || to.allowed_sources().contains(&self)
    }

    /// Status IDs a request may currently hold for a write of `self` to apply.
    pub fn writable_from_ids(self) -> Vec<StatusId> {
        std::iter::once(self)
            .chain(self.allowed_sources().iter().copied())
            .map(RequestStatus::id)
            .collect()
    }
}
