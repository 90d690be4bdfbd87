//! `emitter/keygen/`: derives channel keys from a master or extendable key.

use serde::{Deserialize, Serialize};

use super::{to_json, Error, Service};
use crate::security::{perm, Channel, Key};
use crate::session::Session;

#[derive(Debug, Deserialize)]
pub struct KeyGenRequest {
    #[serde(default)]
    pub req: u16,
    pub key: String,
    pub channel: String,
    #[serde(default, rename = "type")]
    pub access: String,
    /// Seconds until the new key expires, 0 for never
    #[serde(default)]
    pub ttl: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyGenResponse {
    pub req: u16,
    pub status: u16,
    pub key: String,
    pub channel: String,
}

impl Service {
    pub(super) fn on_keygen(&self, conn: &Session, payload: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let request: KeyGenRequest = serde_json::from_slice(payload).map_err(|_| Error::BadRequest)?;
        let (key, channel) = self.keygen(&request, conn.name())?;
        to_json(&KeyGenResponse {
            req: request.req,
            status: 200,
            key,
            channel,
        })
    }

    /// Mints the key described by the request; returns it encrypted along
    /// with the channel it is scoped to.
    pub fn keygen(&self, request: &KeyGenRequest, conn_name: &str) -> Result<(String, String), Error> {
        let parent = self.decrypt(&request.key)?;
        self.check_key(&parent, &request.key)?;
        self.contract_of(&parent)?;

        let now = self.clock.now_secs();
        let requested = perm::from_letters(&request.access);
        let expires = match request.ttl {
            0 => 0,
            ttl => now + ttl as i64,
        };

        let mut key = Key::new();
        key.set_salt(rand::random());
        key.set_master(parent.master());
        key.set_contract(parent.contract());
        key.set_signature(parent.signature());

        let target = if parent.is_master() {
            key.set_permissions(requested);
            key.set_expires(expires);
            request.channel.clone()
        } else if parent.has_permission(perm::EXTEND) {
            // The extended channel has to fall within the parent's target.
            let channel = Channel::parse(format!("{}/{}", request.key, request.channel).as_bytes());
            if !channel.is_static() || !parent.validate_channel(&channel) {
                return Err(Error::Unauthorized);
            }

            key.set_permissions(requested & parent.permissions() & !(perm::EXTEND | perm::MASTER));
            key.set_expires(match (parent.expires(), expires) {
                (Some(cap), 0) => cap,
                (Some(cap), t) => t.min(cap),
                (None, t) => t,
            });
            format!("{}{}/", channel.path(), conn_name)
        } else {
            return Err(Error::Unauthorized);
        };

        key.set_target(&target)?;
        Ok((self.cipher.encrypt_key(&key), target))
    }
}
