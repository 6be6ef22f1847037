// `Principal` (spec §9 re-architecture item: "construct once at the
// auth-middleware boundary" instead of scattering claim lookups through
// handlers). Node-agent push endpoints and CLI integration tests hand
// this around as `Copy`-cheap context, never the raw `Authorization`
// header.

use orbit_base::error::{err, Result};
use orbit_base::ids::UserId;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub wallet_address: String,
    pub roles: Vec<Role>,
}

impl Principal {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(Role::Admin)
    }

    /// Parse the non-production bearer stub named in spec §6:
    /// `Authorization: Bearer <user_id>:<wallet_address>`. The real
    /// bearer-token verification algorithm is out of scope (spec §1);
    /// this exists so `orbitd`'s extractor has something concrete to
    /// call rather than inventing its own parsing inline.
    pub fn from_bearer(header_value: &str) -> Result<Self> {
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or_else(|| err("missing Bearer prefix"))?;
        let (user_id_str, wallet_address) = token
            .split_once(':')
            .ok_or_else(|| err("malformed bearer token, expected <user_id>:<wallet_address>"))?;
        if wallet_address.is_empty() {
            return Err(err("malformed bearer token, empty wallet address"));
        }
        let user_id: UserId = user_id_str
            .parse()
            .map_err(|_| err(format!("malformed bearer token, bad user id {user_id_str}")))?;
        Ok(Self {
            user_id,
            wallet_address: wallet_address.to_string(),
            roles: vec![Role::User],
        })
    }
}
