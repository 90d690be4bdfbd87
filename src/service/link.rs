//! `emitter/link/`: short per-connection aliases for channels.

use serde::{Deserialize, Serialize};

use super::{to_json, Error, Service};
use crate::security::{perm, Channel, Key};
use crate::session::Session;

/// Longest accepted link name.
pub const MAX_NAME_LEN: usize = 16;

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    #[serde(default)]
    pub req: u16,
    pub name: String,
    pub key: String,
    pub channel: String,
    #[serde(default)]
    pub subscribe: bool,
    /// Bind the link to a channel private to this connection
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkResponse {
    pub req: u16,
    pub status: u16,
    pub name: String,
    pub channel: String,
}

pub fn is_valid_name(name: &str) -> bool {
    (1..=MAX_NAME_LEN).contains(&name.len()) && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

impl Service {
    pub(super) async fn on_link(&self, conn: &std::sync::Arc<Session>, payload: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let request: LinkRequest = serde_json::from_slice(payload).map_err(|_| Error::BadRequest)?;
        if !is_valid_name(&request.name) {
            return Err(Error::BadRequest);
        }

        let channel = Channel::parse(format!("{}/{}", request.key, request.channel).as_bytes());
        if !channel.is_static() {
            return Err(Error::BadRequest);
        }

        let (key, path) = if request.private {
            self.private_link(&request.key, &channel, conn.name())?
        } else {
            self.authorize(&channel, perm::NONE)?;
            (request.key.clone(), channel.path().to_string())
        };

        let full = format!("{}/{}", key, path);
        if !conn.add_link(&request.name, full.clone()) {
            return Err(Error::BadRequest);
        }
        if request.subscribe {
            self.on_subscribe(conn, full.as_bytes()).await?;
        }

        to_json(&LinkResponse {
            req: request.req,
            status: 200,
            name: request.name,
            channel: path,
        })
    }

    /// Mints an extended key for `{channel}{connection}/`.
    fn private_link(&self, text: &str, channel: &Channel, conn_name: &str) -> Result<(String, String), Error> {
        let parent = self.decrypt(text)?;
        self.check_key(&parent, text)?;
        self.contract_of(&parent)?;
        if !parent.has_permission(perm::EXTEND) || !parent.validate_channel(channel) {
            return Err(Error::Unauthorized);
        }

        let target = format!("{}{}/", channel.path(), conn_name);
        let mut key = Key::new();
        key.set_salt(rand::random());
        key.set_master(parent.master());
        key.set_contract(parent.contract());
        key.set_signature(parent.signature());
        key.set_permissions(parent.permissions() & !(perm::EXTEND | perm::MASTER));
        key.set_expires(parent.expires().unwrap_or(0));
        key.set_target(&target)?;
        Ok((self.cipher.encrypt_key(&key), target))
    }
}
