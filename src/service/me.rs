//! `emitter/me/`: tells a connection who it is.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{to_json, Error, Service};
use crate::session::Session;

#[derive(Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub req: u16,
    pub id: String,
    /// Link name -> channel, keys omitted
    pub links: HashMap<String, String>,
}

impl Service {
    pub(super) fn on_me(&self, conn: &Session, req: u16) -> Result<Option<Vec<u8>>, Error> {
        let links = conn
            .links()
            .into_iter()
            .map(|(name, channel)| {
                let path = channel
                    .split_once('/')
                    .map(|(_, path)| path.to_string())
                    .unwrap_or(channel);
                (name, path)
            })
            .collect();
        to_json(&MeResponse {
            req,
            id: conn.name().to_string(),
            links,
        })
    }
}
