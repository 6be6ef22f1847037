// Entity identifiers. Kept as small newtypes over `Uuid`, following the
// teacher's `submerge-net::NodeID` pattern of a plain newtype with a full
// derive stack rather than a type alias, so ids from different entity
// kinds can't be accidentally swapped at a call site.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

entity_id!(NodeId);
entity_id!(VmId);
entity_id!(ObligationId);
entity_id!(UserId);
entity_id!(UsageRecordId);
entity_id!(CommandId);
entity_id!(CustomDomainId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_and_roundtrip() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert_ne!(a, b);
        let s = a.to_string();
        let parsed: NodeId = s.parse().unwrap();
        assert_eq!(a, parsed);
    }
}
