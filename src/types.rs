//! Identifier and version types shared by every layer.
//!
//! Node, session and object identifiers are 128-bit values. Object versions
//! are 128-bit counters with a small set of reserved sentinels at the top of
//! the range.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! uuid_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(pub u128);

        impl $name {
            /// The all-zero identifier, never assigned to a live entity.
            pub const ZERO: $name = $name(0);

            /// Generate a random identifier.
            pub fn generate() -> Self {
                loop {
                    let value: u128 = rand::random();
                    if value != 0 {
                        return $name(value);
                    }
                }
            }

            #[inline]
            pub fn is_zero(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:032x}", self.0)
            }
        }
    };
}

uuid_type!(
    /// Identity of a node in the cluster.
    NodeId
);
uuid_type!(
    /// Identity of a session namespace.
    SessionId
);

/// Session-wide identifier of a distributed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ObjectId(pub u128);

impl ObjectId {
    /// Marks "no identifier" (allocation failure, unattached object).
    pub const INVALID: ObjectId = ObjectId(u128::MAX);

    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != ObjectId::INVALID
    }

    /// Identifier `n` positions after this one.
    #[inline]
    pub fn offset(&self, n: u32) -> ObjectId {
        ObjectId(self.0 + n as u128)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Node-local instance number of an attached object.
pub type InstanceId = u32;

/// Addresses every local instance of an object id.
pub const INSTANCE_ALL: InstanceId = u32::MAX - 1;
/// No instance; used before attach.
pub const INSTANCE_INVALID: InstanceId = u32::MAX;
/// Largest instance id handed out by a session.
pub const INSTANCE_MAX: InstanceId = u32::MAX - 16;

/// Request identifier used by the request handler.
pub type RequestId = u32;

/// Marks a packet that expects no reply.
pub const REQUEST_INVALID: RequestId = u32::MAX;

/// Object version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(pub u128);

impl Version {
    /// No data: the object has never been committed or applied.
    pub const NONE: Version = Version(0);
    /// First committed version.
    pub const FIRST: Version = Version(1);
    /// Most recent version available (sync target).
    pub const HEAD: Version = Version(u128::MAX - 3);
    /// The version after the current one (sync target).
    pub const NEXT: Version = Version(u128::MAX - 2);
    /// Oldest version retained by the master (map target).
    pub const OLDEST: Version = Version(u128::MAX - 1);
    /// Unusable version.
    pub const INVALID: Version = Version(u128::MAX);

    /// True for concrete versions, false for the symbolic sentinels.
    #[inline]
    pub fn is_concrete(&self) -> bool {
        self.0 < Version::HEAD.0
    }

    #[inline]
    pub fn next(&self) -> Version {
        debug_assert!(self.is_concrete(), "next() on symbolic version {}", self);
        Version(self.0 + 1)
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::NONE
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Version::HEAD => write!(f, "HEAD"),
            Version::NEXT => write!(f, "NEXT"),
            Version::OLDEST => write!(f, "OLDEST"),
            Version::INVALID => write!(f, "INVALID"),
            Version(v) => write!(f, "{}", v),
        }
    }
}
