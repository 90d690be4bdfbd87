//! `emitter/keyban/`: bans or unbans a key across the cluster.

use serde::{Deserialize, Serialize};

use super::{to_json, Error, Service};
use crate::event::{Ban, Event, EventType};

#[derive(Debug, Deserialize)]
pub struct KeyBanRequest {
    #[serde(default)]
    pub req: u16,
    /// Master key of the target's contract
    pub secret: String,
    /// Key to ban or unban
    pub target: String,
    pub banned: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyBanResponse {
    pub req: u16,
    pub status: u16,
    pub banned: bool,
}

impl Service {
    pub(super) fn on_keyban(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let request: KeyBanRequest = serde_json::from_slice(payload).map_err(|_| Error::BadRequest)?;
        self.keyban(&request)?;
        to_json(&KeyBanResponse {
            req: request.req,
            status: 200,
            banned: request.banned,
        })
    }

    pub fn keyban(&self, request: &KeyBanRequest) -> Result<(), Error> {
        let secret = self.decrypt(&request.secret)?;
        if !secret.is_master() || secret.is_expired_at(self.clock.now_secs()) {
            return Err(Error::Unauthorized);
        }
        self.contract_of(&secret)?;

        let target = self
            .cipher
            .decrypt_key(request.target.as_bytes())
            .map_err(|_| Error::BadRequest)?;
        if target.contract() != secret.contract() {
            return Err(Error::Unauthorized);
        }

        let ban = Ban(request.target.clone());
        match (request.banned, self.state.contains(&ban)) {
            (true, false) => self.state.add(&ban),
            (false, true) => self.state.remove(&ban),
            _ => return Ok(()),
        }
        self.network.notify_change(EventType::Ban, ban.encode());
        self.metrics.bans_total.inc();
        Ok(())
    }
}
